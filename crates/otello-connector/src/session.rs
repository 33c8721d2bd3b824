//! Adaptation sessions.
//!
//! An [`AdaptationSession`] correlates the actions published towards an end
//! node with the confirmations the node sends back. Each operation kind is
//! armed as a single-consumer completion handle which settles exactly once:
//! with the node reply, with a node-reported failure, or with a timeout.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tracing::debug;

use crate::error::{Error, ErrorKind, Result};

/// How long a correlated operation may stay unsettled.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(5000);

/// Kinds of correlated operations within an adaptation session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Opening of an adaptation window.
    Init,
    /// Transfer of one application source file.
    Write,
    /// Removal of one path from the node storage.
    Delete,
    /// Finalization of the transferred application.
    Commit,
    /// Restoration of the previous application.
    Rollback,
}

impl OperationKind {
    /// Returns the operation kind name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }

    /// Checks whether the operation may be armed again after it settled.
    ///
    /// Only `write` and `delete` run more than once per session.
    #[must_use]
    pub const fn repeatable(self) -> bool {
        matches!(self, Self::Write | Self::Delete)
    }
}

impl core::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.name().fmt(f)
    }
}

/// A reply settling a correlated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationReply {
    /// The node acknowledged the operation without a payload.
    Acknowledged,
    /// The node wrote a file and reported its path.
    Written(String),
    /// The node deleted the reported paths.
    Deleted(Vec<String>),
}

/// Per-operation settlement deadlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimeouts {
    init: Duration,
    write: Duration,
    delete: Duration,
    commit: Duration,
    rollback: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            init: DEFAULT_OPERATION_TIMEOUT,
            write: DEFAULT_OPERATION_TIMEOUT,
            delete: DEFAULT_OPERATION_TIMEOUT,
            commit: DEFAULT_OPERATION_TIMEOUT,
            rollback: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl SessionTimeouts {
    /// Creates [`SessionTimeouts`] with every deadline set to
    /// [`DEFAULT_OPERATION_TIMEOUT`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `init` deadline.
    #[must_use]
    pub const fn init(mut self, timeout: Duration) -> Self {
        self.init = timeout;
        self
    }

    /// Sets the `write` deadline.
    #[must_use]
    pub const fn write(mut self, timeout: Duration) -> Self {
        self.write = timeout;
        self
    }

    /// Sets the `delete` deadline.
    #[must_use]
    pub const fn delete(mut self, timeout: Duration) -> Self {
        self.delete = timeout;
        self
    }

    /// Sets the `commit` deadline.
    #[must_use]
    pub const fn commit(mut self, timeout: Duration) -> Self {
        self.commit = timeout;
        self
    }

    /// Sets the `rollback` deadline.
    #[must_use]
    pub const fn rollback(mut self, timeout: Duration) -> Self {
        self.rollback = timeout;
        self
    }

    /// Returns the deadline for an operation kind.
    #[must_use]
    pub const fn operation(&self, kind: OperationKind) -> Duration {
        match kind {
            OperationKind::Init => self.init,
            OperationKind::Write => self.write,
            OperationKind::Delete => self.delete,
            OperationKind::Commit => self.commit,
            OperationKind::Rollback => self.rollback,
        }
    }
}

type Settlement = core::result::Result<OperationReply, Error>;

#[derive(Debug, Default)]
struct SessionState {
    pending: HashMap<OperationKind, oneshot::Sender<Settlement>>,
    armed: HashSet<OperationKind>,
    aborted: Option<String>,
}

/// A single adaptation session towards one end node.
pub struct AdaptationSession {
    state: Arc<Mutex<SessionState>>,
    timeouts: SessionTimeouts,
}

impl core::fmt::Debug for AdaptationSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdaptationSession")
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl AdaptationSession {
    /// Creates an [`AdaptationSession`] with the given deadlines.
    #[must_use]
    pub fn new(timeouts: SessionTimeouts) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::default())),
            timeouts,
        }
    }

    /// Arms an operation and returns the handle which awaits its settlement.
    ///
    /// Arming fails when the session was aborted, when the operation is
    /// already in flight, or when a non-repeatable operation was already
    /// armed within this session.
    pub async fn arm(&self, kind: OperationKind) -> Result<PendingOperation> {
        let mut state = self.state.lock().await;

        if let Some(reason) = state.aborted.as_ref() {
            return Err(Error::new(
                ErrorKind::SessionAborted,
                format!("cannot arm `{kind}`, the session was aborted: {reason}"),
            ));
        }

        if state.pending.contains_key(&kind) {
            return Err(Error::new(
                ErrorKind::AlreadySettled,
                format!("`{kind}` is already in flight"),
            ));
        }

        if !kind.repeatable() && state.armed.contains(&kind) {
            return Err(Error::new(
                ErrorKind::AlreadySettled,
                format!("`{kind}` settles at most once per session"),
            ));
        }

        let (sender, receiver) = oneshot::channel();
        let _ = state.pending.insert(kind, sender);
        let _ = state.armed.insert(kind);

        Ok(PendingOperation {
            kind,
            deadline: self.timeouts.operation(kind),
            state: self.state.clone(),
            receiver,
        })
    }

    /// Settles a pending operation with a node reply.
    ///
    /// Returns `false` when no such operation is pending, so duplicate or
    /// late replies are absorbed without effect.
    pub async fn resolve(&self, kind: OperationKind, reply: OperationReply) -> bool {
        let mut state = self.state.lock().await;
        match state.pending.remove(&kind) {
            Some(sender) => sender.send(Ok(reply)).is_ok(),
            None => false,
        }
    }

    /// Settles a pending operation with an error.
    ///
    /// Returns `false` when no such operation is pending.
    pub async fn reject(&self, kind: OperationKind, error: Error) -> bool {
        let mut state = self.state.lock().await;
        match state.pending.remove(&kind) {
            Some(sender) => sender.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Rejects every pending operation with a node-reported failure.
    ///
    /// Returns how many operations were rejected.
    pub async fn fail_pending(&self, message: &str) -> usize {
        let mut state = self.state.lock().await;
        let rejected = state.pending.len();
        for (kind, sender) in state.pending.drain() {
            let _ = sender.send(Err(Error::new(
                ErrorKind::Operation,
                format!("`{kind}` failed on the end node: {message}"),
            )));
        }
        rejected
    }

    /// Aborts the session.
    ///
    /// Every pending operation is rejected and no further operation can be
    /// armed. Aborting an already aborted session has no effect.
    pub async fn abort(&self, reason: &str) {
        let mut state = self.state.lock().await;

        if state.aborted.is_some() {
            debug!("session already aborted, `{reason}` absorbed");
            return;
        }

        state.aborted = Some(reason.to_owned());
        for (kind, sender) in state.pending.drain() {
            let _ = sender.send(Err(Error::new(
                ErrorKind::SessionAborted,
                format!("`{kind}` rejected: {reason}"),
            )));
        }
    }

    /// Checks whether the session was aborted.
    pub async fn is_aborted(&self) -> bool {
        self.state.lock().await.aborted.is_some()
    }
}

/// A handle awaiting the settlement of one armed operation.
#[derive(Debug)]
pub struct PendingOperation {
    kind: OperationKind,
    deadline: Duration,
    state: Arc<Mutex<SessionState>>,
    receiver: oneshot::Receiver<Settlement>,
}

impl PendingOperation {
    /// Returns the operation kind this handle settles.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Awaits the settlement, racing it against the operation deadline.
    pub async fn wait(self) -> Result<OperationReply> {
        match tokio::time::timeout(self.deadline, self.receiver).await {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_)) => Err(Error::new(
                ErrorKind::SessionAborted,
                format!("the completion handle for `{}` was discarded", self.kind),
            )),
            Err(_) => {
                // A settlement arriving past this point finds no pending
                // entry and is absorbed.
                let mut state = self.state.lock().await;
                let _ = state.pending.remove(&self.kind);
                Err(Error::new(
                    ErrorKind::Timeout,
                    format!(
                        "`{}` not settled within {} ms",
                        self.kind,
                        self.deadline.as_millis()
                    ),
                ))
            }
        }
    }
}
