//! Transaction sessions and the commit/rollback/release coordinator
//!
//! A session moves through `NotStarted -> Active -> {Committed | RolledBack}
//! -> Released` and never revisits a state. [`run_in_transaction`] drives one
//! session through that machine around a unit of work: exactly one of commit
//! or rollback, then release, whatever the work did (including panicking).
//!
//! # Example
//!
//! ```rust
//! use acton_dal::repository::{run_in_transaction, RepositoryError, SessionState, TransactionSession};
//! use acton_dal::store::{EntityStore, MemoryStore};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = MemoryStore::new();
//! let session = store.session();
//!
//! let answer = run_in_transaction(session.clone(), |tx| async move {
//!     assert_eq!(tx.state(), SessionState::Active);
//!     Ok::<_, RepositoryError>(42)
//! })
//! .await
//! .unwrap();
//!
//! assert_eq!(answer, 42);
//! assert_eq!(session.state(), SessionState::Released);
//! # });
//! ```

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use super::error::{RepositoryError, RepositoryOperation};
use crate::error::StoreError;

/// Lifecycle state of a transaction session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Obtained but not started
    NotStarted = 0,
    /// Started; operations may run through it
    Active = 1,
    /// Committed; waiting for release
    Committed = 2,
    /// Rolled back; waiting for release
    RolledBack = 3,
    /// Released; terminal
    Released = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Active,
            2 => Self::Committed,
            3 => Self::RolledBack,
            _ => Self::Released,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Released => write!(f, "released"),
        }
    }
}

/// Shared, clone-able holder for a session's [`SessionState`]
///
/// Store sessions embed one and guard every transition through it, so every
/// clone of a session observes the same state.
#[derive(Debug, Clone, Default)]
pub struct SessionStateCell(Arc<AtomicU8>);

impl SessionStateCell {
    /// A cell in `NotStarted`
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Fail unless the current state is one of `allowed`
    pub fn expect(&self, allowed: &[SessionState], action: &str) -> Result<SessionState, StoreError> {
        let current = self.get();
        if allowed.contains(&current) {
            Ok(current)
        } else {
            Err(StoreError::transaction_failed(format!(
                "cannot {} a session in state {}",
                action, current
            )))
        }
    }

    /// Fail unless the session is `Active`
    pub fn expect_active(&self) -> Result<(), StoreError> {
        self.expect(&[SessionState::Active], "use").map(|_| ())
    }

    /// Move to `to`, provided the state is still one of `from`
    pub fn transition(
        &self,
        from: &[SessionState],
        to: SessionState,
        action: &str,
    ) -> Result<(), StoreError> {
        loop {
            let current = self.expect(from, action)?;
            if self
                .0
                .compare_exchange(current as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
}

/// States a session may be released from
pub const RELEASABLE: &[SessionState] = &[
    SessionState::NotStarted,
    SessionState::Active,
    SessionState::Committed,
    SessionState::RolledBack,
];

/// A transactional context binding several operations into one unit of work
///
/// Sessions are cheap handles over shared state: clones refer to the same
/// transaction. A session is owned by one call stack until it is released.
pub trait TransactionSession: Clone + Send + Sync + 'static {
    /// `NotStarted -> Active`
    fn start(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// `Active -> Committed`; on failure the state is left unchanged
    fn commit(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// `Active -> RolledBack`
    fn rollback(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Any non-terminal state `-> Released`; discards uncommitted work
    fn release(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Current lifecycle state
    fn state(&self) -> SessionState;
}

fn tx_error(err: StoreError) -> RepositoryError {
    RepositoryError::from_store(RepositoryOperation::Transaction, err)
}

/// Run `work` inside `session`, committing on success and rolling back on failure
///
/// The session is started here and released exactly once before returning.
/// `work` receives a clone of the active session and must route its own
/// repository calls through it.
///
/// Outcomes:
///
/// - start fails: the session is released and the start error is returned
/// - `work` fails: rollback, release, and the work's own error is returned
///   unchanged (rollback/release failures are logged)
/// - commit fails: best-effort rollback, release, then the commit error
/// - release fails after a commit: the release error is returned
/// - `work` panics: rollback and release run, then the panic resumes
pub async fn run_in_transaction<S, F, Fut, R, E>(session: S, work: F) -> Result<R, E>
where
    S: TransactionSession,
    F: FnOnce(S) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: From<RepositoryError>,
{
    if let Err(e) = session.start().await {
        warn!(error = %e, "failed to start transaction");
        if let Err(release_err) = session.release().await {
            error!(error = %release_err, "failed to release session after start failure");
        }
        return Err(tx_error(e).into());
    }
    debug!("transaction started");

    let tx = session.clone();
    let outcome = AssertUnwindSafe(async move { work(tx).await })
        .catch_unwind()
        .await;

    let result = match outcome {
        Ok(Ok(value)) => match session.commit().await {
            Ok(()) => {
                debug!("transaction committed");
                Ok(value)
            }
            Err(e) => {
                error!(error = %e, "commit failed, rolling back");
                if let Err(rollback_err) = session.rollback().await {
                    error!(error = %rollback_err, "rollback after failed commit also failed");
                }
                Err(tx_error(e).into())
            }
        },
        Ok(Err(err)) => {
            debug!("unit of work failed, rolling back");
            if let Err(rollback_err) = session.rollback().await {
                error!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
        Err(panic) => {
            error!("unit of work panicked, rolling back");
            if let Err(rollback_err) = session.rollback().await {
                error!(error = %rollback_err, "rollback after panic failed");
            }
            if let Err(release_err) = session.release().await {
                error!(error = %release_err, "release after panic failed");
            }
            std::panic::resume_unwind(panic);
        }
    };

    match session.release().await {
        Ok(()) => result,
        Err(e) => {
            error!(error = %e, "failed to release session");
            match result {
                Ok(_) => Err(tx_error(e).into()),
                Err(err) => Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepositoryErrorKind;
    use std::sync::Mutex;

    /// Records every lifecycle call; individual steps can be told to fail
    #[derive(Clone, Default)]
    struct RecordingSession {
        calls: Arc<Mutex<Vec<&'static str>>>,
        state: SessionStateCell,
        fail_start: bool,
        fail_commit: bool,
        fail_rollback: bool,
        fail_release: bool,
    }

    impl RecordingSession {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl TransactionSession for RecordingSession {
        async fn start(&self) -> Result<(), StoreError> {
            self.record("start");
            if self.fail_start {
                return Err(StoreError::connection_failed("no connection"));
            }
            self.state
                .transition(&[SessionState::NotStarted], SessionState::Active, "start")
        }

        async fn commit(&self) -> Result<(), StoreError> {
            self.record("commit");
            if self.fail_commit {
                return Err(StoreError::transaction_failed("serialization failure"));
            }
            self.state
                .transition(&[SessionState::Active], SessionState::Committed, "commit")
        }

        async fn rollback(&self) -> Result<(), StoreError> {
            self.record("rollback");
            if self.fail_rollback {
                return Err(StoreError::transaction_failed("rollback refused"));
            }
            self.state
                .transition(&[SessionState::Active], SessionState::RolledBack, "rollback")
        }

        async fn release(&self) -> Result<(), StoreError> {
            self.record("release");
            if self.fail_release {
                return Err(StoreError::transaction_failed("release refused"));
            }
            self.state
                .transition(RELEASABLE, SessionState::Released, "release")
        }

        fn state(&self) -> SessionState {
            self.state.get()
        }
    }

    #[derive(Debug, PartialEq)]
    enum AppError {
        Repo(RepositoryErrorKind),
        Business(&'static str),
    }

    impl From<RepositoryError> for AppError {
        fn from(err: RepositoryError) -> Self {
            AppError::Repo(err.kind)
        }
    }

    #[tokio::test]
    async fn test_success_commits_then_releases() {
        let session = RecordingSession::default();
        let result = run_in_transaction(session.clone(), |_tx| async { Ok::<_, AppError>(5) }).await;
        assert_eq!(result, Ok(5));
        assert_eq!(session.calls(), vec!["start", "commit", "release"]);
        assert_eq!(session.state(), SessionState::Released);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_and_returns_original_error() {
        let session = RecordingSession::default();
        let result: Result<(), AppError> =
            run_in_transaction(session.clone(), |_tx| async { Err(AppError::Business("nope")) })
                .await;
        assert_eq!(result, Err(AppError::Business("nope")));
        assert_eq!(session.calls(), vec!["start", "rollback", "release"]);
    }

    #[tokio::test]
    async fn test_work_sees_active_session() {
        let session = RecordingSession::default();
        let seen = run_in_transaction(session.clone(), |tx| async move {
            Ok::<_, AppError>(tx.state())
        })
        .await;
        assert_eq!(seen, Ok(SessionState::Active));
    }

    #[tokio::test]
    async fn test_start_failure_releases_without_running_work() {
        let session = RecordingSession {
            fail_start: true,
            ..Default::default()
        };
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let result: Result<(), AppError> = run_in_transaction(session.clone(), |_tx| async move {
            *flag.lock().unwrap() = true;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(AppError::Repo(RepositoryErrorKind::ConnectionFailed)));
        assert!(!*ran.lock().unwrap());
        assert_eq!(session.calls(), vec!["start", "release"]);
    }

    #[tokio::test]
    async fn test_commit_failure_propagates_after_release() {
        let session = RecordingSession {
            fail_commit: true,
            ..Default::default()
        };
        let result = run_in_transaction(session.clone(), |_tx| async { Ok::<_, AppError>(1) }).await;
        assert_eq!(result, Err(AppError::Repo(RepositoryErrorKind::TransactionFailed)));
        assert_eq!(session.calls(), vec!["start", "commit", "rollback", "release"]);
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_original_error() {
        let session = RecordingSession {
            fail_rollback: true,
            ..Default::default()
        };
        let result: Result<(), AppError> =
            run_in_transaction(session.clone(), |_tx| async { Err(AppError::Business("boom")) })
                .await;
        assert_eq!(result, Err(AppError::Business("boom")));
        assert_eq!(session.calls(), vec!["start", "rollback", "release"]);
    }

    #[tokio::test]
    async fn test_release_failure_after_commit_is_reported() {
        let session = RecordingSession {
            fail_release: true,
            ..Default::default()
        };
        let result = run_in_transaction(session.clone(), |_tx| async { Ok::<_, AppError>(()) }).await;
        assert_eq!(result, Err(AppError::Repo(RepositoryErrorKind::TransactionFailed)));
        assert_eq!(session.calls(), vec!["start", "commit", "release"]);
    }

    #[tokio::test]
    async fn test_release_failure_does_not_mask_work_error() {
        let session = RecordingSession {
            fail_release: true,
            ..Default::default()
        };
        let result: Result<(), AppError> =
            run_in_transaction(session.clone(), |_tx| async { Err(AppError::Business("first")) })
                .await;
        assert_eq!(result, Err(AppError::Business("first")));
    }

    #[tokio::test]
    async fn test_panic_rolls_back_releases_and_resumes() {
        let session = RecordingSession::default();
        let observed = session.clone();
        let handle = tokio::spawn(async move {
            run_in_transaction(session, |_tx| async {
                if true {
                    panic!("unit of work exploded");
                }
                Ok::<(), AppError>(())
            })
            .await
        });
        let join = handle.await;
        assert!(join.is_err_and(|e| e.is_panic()));
        assert_eq!(observed.calls(), vec!["start", "rollback", "release"]);
        assert_eq!(observed.state(), SessionState::Released);
    }

    #[test]
    fn test_state_cell_rejects_revisits() {
        let cell = SessionStateCell::new();
        assert_eq!(cell.get(), SessionState::NotStarted);
        cell.transition(&[SessionState::NotStarted], SessionState::Active, "start")
            .unwrap();
        assert!(cell
            .transition(&[SessionState::NotStarted], SessionState::Active, "start")
            .is_err());
        cell.transition(&[SessionState::Active], SessionState::Committed, "commit")
            .unwrap();
        cell.transition(RELEASABLE, SessionState::Released, "release")
            .unwrap();
        let err = cell
            .transition(RELEASABLE, SessionState::Released, "release")
            .unwrap_err();
        assert!(err.message.contains("released"));
    }

    #[test]
    fn test_expect_active() {
        let cell = SessionStateCell::new();
        assert!(cell.expect_active().is_err());
        cell.transition(&[SessionState::NotStarted], SessionState::Active, "start")
            .unwrap();
        assert!(cell.expect_active().is_ok());
    }
}
