//! Error types and kinds.

use std::borrow::Cow;

use tracing::error;

/// All possible error kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A lifecycle transition which is not part of the transition table.
    InvalidTransition,
    /// A lifecycle transition towards the state the node is already in.
    AlreadyInState,
    /// A transition effect reported a failure.
    Callback,
    /// A correlated operation was not settled within its deadline.
    Timeout,
    /// An adaptation session was aborted before the operation settled.
    SessionAborted,
    /// A single-shot operation was armed more than once within a session.
    AlreadySettled,
    /// An adaptation session is already running for the node.
    SessionInProgress,
    /// An operation which is not admissible in the current lifecycle state.
    InvalidState,
    /// An end node confirmed a write for a path other than the requested one.
    MismatchedWritePath,
    /// An application source without an entrypoint.
    MissingEntrypoint,
    /// No controller is managing the addressed end node.
    ControllerNotFound,
    /// A controller factory is already registered for the compatibility key.
    DuplicateFactory,
    /// A topic which does not follow the naming scheme.
    MalformedTopic,
    /// A payload or affordance layout which violates the protocol contract.
    ProtocolViolation,
    /// An end node reported a failed operation.
    Operation,
    /// A transport-level failure.
    Transport,
    /// A registration handshake failure.
    Registration,
    /// A manifest retrieval or decode failure.
    Manifest,
}

impl ErrorKind {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::InvalidTransition => "Invalid Transition",
            Self::AlreadyInState => "Already In State",
            Self::Callback => "Callback Failure",
            Self::Timeout => "Operation Timeout",
            Self::SessionAborted => "Session Aborted",
            Self::AlreadySettled => "Already Settled",
            Self::SessionInProgress => "Session In Progress",
            Self::InvalidState => "Invalid State",
            Self::MismatchedWritePath => "Mismatched Write Path",
            Self::MissingEntrypoint => "Missing Entrypoint",
            Self::ControllerNotFound => "Controller Not Found",
            Self::DuplicateFactory => "Duplicate Factory",
            Self::MalformedTopic => "Malformed Topic",
            Self::ProtocolViolation => "Protocol Violation",
            Self::Operation => "Operation Failure",
            Self::Transport => "Transport Failure",
            Self::Registration => "Registration Failure",
            Self::Manifest => "Manifest Failure",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.description().fmt(f)
    }
}

/// Connector error.
#[derive(Debug, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    description: Cow<'static, str>,
}

impl Error {
    /// Creates a new [`Error`] from an [`ErrorKind`] and a description.
    ///
    /// The error is logged as soon as it is created.
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        let description = description.into();

        error!("{kind}: {description}");

        Self { kind, description }
    }

    /// Returns the [`ErrorKind`] of the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

impl std::error::Error for Error {}

impl From<rumqttc::v5::ClientError> for Error {
    fn from(e: rumqttc::v5::ClientError) -> Self {
        Self::new(ErrorKind::Transport, e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::new(ErrorKind::Manifest, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::ProtocolViolation, e.to_string())
    }
}

impl From<otello::topic::TopicError> for Error {
    fn from(e: otello::topic::TopicError) -> Self {
        Self::new(ErrorKind::MalformedTopic, e.to_string())
    }
}

/// A specialized [`Result`] type for connector operations.
pub type Result<T> = core::result::Result<T, Error>;
