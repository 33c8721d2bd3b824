use core::fmt;

use serde::Serialize;

/// Name of the lifecycle status property exposed by every end node.
pub const STATUS_PROPERTY: &str = "status";

/// The lifecycle state of an end node, as seen by its connector.
///
/// States form a cycle with no terminal state: a node leaving
/// [`NodeState::Restarting`] comes back as [`NodeState::Application`] and can
/// be adapted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// No contact with the node has been established yet.
    Unknown,
    /// The node is running its application.
    Application,
    /// An adaptation has been requested but the node has not yet entered it.
    AdaptationPrep,
    /// The node is applying an adaptation.
    Adaptation,
    /// The node is rebooting into its (possibly adapted) application.
    Restarting,
}

impl NodeState {
    /// Returns a [`NodeState`] name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Application => "application",
            Self::AdaptationPrep => "adaptation_prep",
            Self::Adaptation => "adaptation",
            Self::Restarting => "restarting",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

/// The value published on an end node's status property.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct StatusUpdate {
    /// The announced lifecycle state.
    pub state: NodeState,
}

impl StatusUpdate {
    /// Creates a [`StatusUpdate`].
    #[must_use]
    pub const fn new(state: NodeState) -> Self {
        Self { state }
    }
}
