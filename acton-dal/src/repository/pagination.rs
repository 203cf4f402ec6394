//! Pagination, ordering and filtering types for repository queries
//!
//! [`FindOptions`] is the query specification handed to `find_all`,
//! `find_one` and friends. It is never mutated by the repository: the default
//! soft-delete predicate is merged into a copy.
//!
//! # Example
//!
//! ```rust
//! use acton_dal::repository::{FilterCondition, FindOptions, OrderDirection, PageRequest};
//!
//! let options = FindOptions::new()
//!     .filter(FilterCondition::eq("status", "active"))
//!     .filter(FilterCondition::gte("age", 18))
//!     .order_by("created_at", OrderDirection::Descending);
//!
//! assert_eq!(options.filters.len(), 2);
//!
//! let request = PageRequest::new(3, 20);
//! assert_eq!(request.offset(), 40);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{RepositoryError, RepositoryOperation};

/// Direction for ordering results
///
/// # Example
///
/// ```rust
/// use acton_dal::repository::OrderDirection;
///
/// assert_eq!(format!("{}", OrderDirection::Ascending), "asc");
/// assert_eq!(format!("{}", OrderDirection::Descending), "desc");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    /// Sort in ascending order (A-Z, 0-9)
    #[default]
    Ascending,
    /// Sort in descending order (Z-A, 9-0)
    Descending,
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascending => write!(f, "asc"),
            Self::Descending => write!(f, "desc"),
        }
    }
}

/// Offset/limit slice handed to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Number of results to skip
    pub offset: u64,
    /// Maximum number of results to return
    pub limit: u64,
}

impl Pagination {
    /// Create new pagination parameters
    #[must_use]
    pub const fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// Create pagination for the first page with the given limit
    #[must_use]
    pub const fn first_page(limit: u64) -> Self {
        Self { offset: 0, limit }
    }
}

/// One page requested by a caller (1-indexed)
///
/// Defaults to `page = 1, limit = 10`. Validation happens in
/// [`PageRequest::validate`] before any store call, so a zero page can never
/// produce a negative skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Page number, starting at 1
    pub page: u64,
    /// Page size
    pub limit: u64,
}

impl PageRequest {
    /// Create a page request
    #[must_use]
    pub const fn new(page: u64, limit: u64) -> Self {
        Self { page, limit }
    }

    /// Number of rows skipped before this page: `(page - 1) * limit`
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }

    /// Reject non-positive pages and limits outside `1..=max_limit`
    pub fn validate(&self, max_limit: u64) -> Result<(), RepositoryError> {
        if self.page < 1 {
            return Err(RepositoryError::validation_failed(
                RepositoryOperation::FindPaginated,
                format!("page must be >= 1, got {}", self.page),
            ));
        }
        if self.limit < 1 || self.limit > max_limit {
            return Err(RepositoryError::validation_failed(
                RepositoryOperation::FindPaginated,
                format!("limit must be between 1 and {}, got {}", max_limit, self.limit),
            ));
        }
        Ok(())
    }

    /// The offset/limit slice this page covers
    #[must_use]
    pub const fn to_pagination(&self) -> Pagination {
        Pagination::new(self.offset(), self.limit)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: 10 }
    }
}

/// A page of results plus the total count over the full filtered set
///
/// # Example
///
/// ```rust
/// use acton_dal::repository::Page;
///
/// let page = Page { data: vec!["a", "b"], total: 5, page: 1, limit: 2 };
/// assert_eq!(page.total_pages(), 3);
/// assert!(page.has_next());
/// assert!(!page.has_prev());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Rows on this page
    pub data: Vec<T>,
    /// Count of every row matching the filters, independent of the slice
    pub total: u64,
    /// Page number (1-indexed)
    pub page: u64,
    /// Page size
    pub limit: u64,
}

impl<T> Page<T> {
    /// Number of pages needed to hold `total` rows
    pub fn total_pages(&self) -> u64 {
        if self.limit == 0 {
            return 0;
        }
        self.total.div_ceil(self.limit)
    }

    /// Whether a later page exists
    pub fn has_next(&self) -> bool {
        self.page < self.total_pages()
    }

    /// Whether an earlier page exists
    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    /// Transform the rows while keeping the page metadata
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            limit: self.limit,
        }
    }
}

/// Comparison operators for filter conditions
///
/// # Example
///
/// ```rust
/// use acton_dal::repository::FilterOperator;
///
/// assert_eq!(format!("{}", FilterOperator::Equal), "=");
/// assert_eq!(format!("{}", FilterOperator::Like), "LIKE");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// Equal to (=)
    Equal,
    /// Not equal to (!=)
    NotEqual,
    /// Greater than (>)
    GreaterThan,
    /// Greater than or equal to (>=)
    GreaterThanOrEqual,
    /// Less than (<)
    LessThan,
    /// Less than or equal to (<=)
    LessThanOrEqual,
    /// Pattern matching (LIKE)
    Like,
    /// Value is in a list (IN)
    In,
    /// Value is null (IS NULL)
    IsNull,
    /// Value is not null (IS NOT NULL)
    IsNotNull,
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => write!(f, "="),
            Self::NotEqual => write!(f, "!="),
            Self::GreaterThan => write!(f, ">"),
            Self::GreaterThanOrEqual => write!(f, ">="),
            Self::LessThan => write!(f, "<"),
            Self::LessThanOrEqual => write!(f, "<="),
            Self::Like => write!(f, "LIKE"),
            Self::In => write!(f, "IN"),
            Self::IsNull => write!(f, "IS NULL"),
            Self::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

/// A value that can be used in filter conditions
///
/// # Example
///
/// ```rust
/// use acton_dal::repository::FilterValue;
/// use serde_json::json;
///
/// let string_val: FilterValue = "active".into();
/// assert_eq!(string_val.to_json(), json!("active"));
///
/// let from_json = FilterValue::from(json!(42));
/// assert_eq!(from_json, FilterValue::Integer(42));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    /// String value
    String(String),
    /// 64-bit integer value
    Integer(i64),
    /// 64-bit floating point value
    Float(f64),
    /// Boolean value
    Boolean(bool),
    /// List of string values (for IN operator)
    StringList(Vec<String>),
    /// List of integer values (for IN operator)
    IntegerList(Vec<i64>),
    /// Any other JSON value (objects, arrays, unsigned numbers out of i64 range)
    Json(Value),
    /// Null value (for IS NULL / IS NOT NULL)
    Null,
}

impl FilterValue {
    /// The JSON value stores compare against
    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Integer(n) => Value::from(*n),
            Self::Float(n) => Value::from(*n),
            Self::Boolean(b) => Value::Bool(*b),
            Self::StringList(list) => Value::from(list.clone()),
            Self::IntegerList(list) => Value::from(list.clone()),
            Self::Json(v) => v.clone(),
            Self::Null => Value::Null,
        }
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for FilterValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<i32> for FilterValue {
    fn from(n: i32) -> Self {
        Self::Integer(i64::from(n))
    }
}

impl From<f64> for FilterValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<bool> for FilterValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<Vec<String>> for FilterValue {
    fn from(list: Vec<String>) -> Self {
        Self::StringList(list)
    }
}

impl From<Vec<i64>> for FilterValue {
    fn from(list: Vec<i64>) -> Self {
        Self::IntegerList(list)
    }
}

impl From<Value> for FilterValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Boolean(b),
            Value::String(s) => Self::String(s),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Self::Integer(i),
                (None, Some(f)) if n.is_f64() => Self::Float(f),
                _ => Self::Json(Value::Number(n)),
            },
            other => Self::Json(other),
        }
    }
}

/// A single filter condition for querying entities
///
/// # Example
///
/// ```rust
/// use acton_dal::repository::FilterCondition;
///
/// let status_filter = FilterCondition::eq("status", "active");
/// let age_filter = FilterCondition::gte("age", 18);
/// let name_filter = FilterCondition::like("name", "%smith%");
/// let deleted_filter = FilterCondition::is_null("deleted_at");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCondition {
    /// The field name to filter on
    pub field: String,
    /// The comparison operator
    pub operator: FilterOperator,
    /// The value to compare against
    pub value: FilterValue,
}

impl FilterCondition {
    /// Create a new filter condition
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: FilterValue) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Create an equality filter (field = value)
    pub fn eq(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::Equal, value.into())
    }

    /// Create a not-equal filter (field != value)
    pub fn ne(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::NotEqual, value.into())
    }

    /// Create a greater-than filter (field > value)
    pub fn gt(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::GreaterThan, value.into())
    }

    /// Create a greater-than-or-equal filter (field >= value)
    pub fn gte(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::GreaterThanOrEqual, value.into())
    }

    /// Create a less-than filter (field < value)
    pub fn lt(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::LessThan, value.into())
    }

    /// Create a less-than-or-equal filter (field <= value)
    pub fn lte(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::LessThanOrEqual, value.into())
    }

    /// Create a LIKE pattern filter (`%` any run, `_` any single character)
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::Like, FilterValue::String(pattern.into()))
    }

    /// Create an IN list filter for strings
    pub fn in_strings(field: impl Into<String>, values: Vec<String>) -> Self {
        Self::new(field, FilterOperator::In, FilterValue::StringList(values))
    }

    /// Create an IN list filter for integers
    pub fn in_integers(field: impl Into<String>, values: Vec<i64>) -> Self {
        Self::new(field, FilterOperator::In, FilterValue::IntegerList(values))
    }

    /// Create an IS NULL filter
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::IsNull, FilterValue::Null)
    }

    /// Create an IS NOT NULL filter
    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::IsNotNull, FilterValue::Null)
    }
}

/// Query specification: predicate, ordering, relations and an optional slice
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Conditions joined with AND
    pub filters: Vec<FilterCondition>,
    /// Sort keys applied in order
    pub order_by: Vec<(String, OrderDirection)>,
    /// Relation names passed through to the store untouched
    pub relations: Vec<String>,
    /// Optional offset/limit slice
    pub pagination: Option<Pagination>,
}

impl FindOptions {
    /// Empty options: no filter, no ordering, no slice
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options holding the given conditions
    #[must_use]
    pub fn with_filters(filters: impl IntoIterator<Item = FilterCondition>) -> Self {
        Self {
            filters: filters.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Add a condition
    #[must_use]
    pub fn filter(mut self, condition: FilterCondition) -> Self {
        self.filters.push(condition);
        self
    }

    /// Add a sort key
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_by.push((field.into(), direction));
        self
    }

    /// Ask the store to load a relation
    #[must_use]
    pub fn relation(mut self, name: impl Into<String>) -> Self {
        self.relations.push(name.into());
        self
    }

    /// Restrict the result to a slice
    #[must_use]
    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Whether any condition targets `field`
    pub fn targets(&self, field: &str) -> bool {
        self.filters.iter().any(|c| c.field == field)
    }
}
