use alloc::format;
use alloc::string::{String, ToString};

use core::fmt;

use serde::Serialize;

/// Default root segment under which a fleet publishes its topics.
pub const DEFAULT_ROOT: &str = "otello";

// Fixed segment of the registration request topic.
const REGISTRATION_SEGMENT: &str = "registration";

// Fixed trailing segment of the registration reply topic.
const REPLY_SEGMENT: &str = "reply";

/// The immutable identifier of an end node.
///
/// It appears as the `{device}` segment of every topic addressing the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a [`DeviceId`].
    #[must_use]
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the [`DeviceId`] as a [`&str`].
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The affordance classes addressable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AffordanceType {
    /// Observable state exposed by an end node.
    Properties,
    /// Notifications emitted by an end node.
    Events,
    /// Operations invokable on an end node.
    Actions,
}

impl AffordanceType {
    /// Returns an [`AffordanceType`] name, equal to its topic segment.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Properties => "properties",
            Self::Events => "events",
            Self::Actions => "actions",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "properties" => Some(Self::Properties),
            "events" => Some(Self::Events),
            "actions" => Some(Self::Actions),
            _ => None,
        }
    }
}

impl fmt::Display for AffordanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

/// The namespace segment separating lifecycle traffic from application
/// traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Lifecycle and adaptation traffic interpreted by the connector.
    Core,
    /// Application traffic cached and forwarded by the connector.
    App,
}

impl Namespace {
    /// Returns a [`Namespace`] name, equal to its topic segment.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::App => "app",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "core" => Some(Self::Core),
            "app" => Some(Self::App),
            _ => None,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

/// All possible topic scheme violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// The topic does not start with the expected root segment.
    ForeignRoot,
    /// The topic carries fewer segments than the scheme requires.
    Truncated,
    /// The device segment is empty.
    EmptyDeviceId,
    /// The affordance segment is not `properties`, `events`, or `actions`.
    UnknownAffordance,
    /// The namespace segment is not `core` or `app`.
    UnknownNamespace,
    /// The affordance name is empty.
    EmptyName,
    /// The topic is not a registration request.
    NotRegistration,
}

impl TopicError {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::ForeignRoot => "topic does not start with the root segment",
            Self::Truncated => "topic has too few segments",
            Self::EmptyDeviceId => "topic has an empty device segment",
            Self::UnknownAffordance => "topic has an unknown affordance segment",
            Self::UnknownNamespace => "topic has an unknown namespace segment",
            Self::EmptyName => "topic has an empty affordance name",
            Self::NotRegistration => "topic is not a registration request",
        }
    }
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.description().fmt(f)
    }
}

impl core::error::Error for TopicError {}

/// A parsed affordance topic.
///
/// Topics follow the `{root}/{device}/{affordance}/{namespace}/{name}`
/// scheme. The name may span several segments; everything after the
/// namespace belongs to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPath {
    /// The addressed end node.
    pub device_id: DeviceId,
    /// The affordance class.
    pub affordance: AffordanceType,
    /// The traffic namespace.
    pub namespace: Namespace,
    /// The affordance name.
    pub name: String,
}

impl TopicPath {
    /// Parses a topic against the scheme rooted at `root`.
    ///
    /// # Errors
    ///
    /// A [`TopicError`] is returned when any part of the scheme is violated.
    pub fn parse(root: &str, topic: &str) -> Result<Self, TopicError> {
        let rest = strip_root(root, topic)?;

        let mut segments = rest.splitn(4, '/');

        let device_id = segments.next().ok_or(TopicError::Truncated)?;
        if device_id.is_empty() {
            return Err(TopicError::EmptyDeviceId);
        }

        let affordance = segments.next().ok_or(TopicError::Truncated)?;
        let affordance =
            AffordanceType::from_segment(affordance).ok_or(TopicError::UnknownAffordance)?;

        let namespace = segments.next().ok_or(TopicError::Truncated)?;
        let namespace = Namespace::from_segment(namespace).ok_or(TopicError::UnknownNamespace)?;

        let name = segments.next().ok_or(TopicError::Truncated)?;
        if name.is_empty() {
            return Err(TopicError::EmptyName);
        }

        Ok(Self {
            device_id: DeviceId::from(device_id),
            affordance,
            namespace,
            name: name.to_string(),
        })
    }

    /// Renders the topic addressing this path under the given root.
    #[must_use]
    pub fn render(&self, root: &str) -> String {
        affordance_topic(
            root,
            &self.device_id,
            self.affordance,
            self.namespace,
            &self.name,
        )
    }
}

#[inline]
fn strip_root<'a>(root: &str, topic: &'a str) -> Result<&'a str, TopicError> {
    topic
        .strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or(TopicError::ForeignRoot)
}

/// Renders the topic of an affordance.
#[must_use]
pub fn affordance_topic(
    root: &str,
    device_id: &DeviceId,
    affordance: AffordanceType,
    namespace: Namespace,
    name: &str,
) -> String {
    format!("{root}/{device_id}/{affordance}/{namespace}/{name}")
}

/// Renders the topic on which an end node requests its registration.
#[must_use]
pub fn registration_topic(root: &str, device_id: &DeviceId) -> String {
    format!("{root}/{device_id}/{REGISTRATION_SEGMENT}")
}

/// Renders the topic on which a connector replies to a registration request.
#[must_use]
pub fn registration_reply_topic(root: &str, device_id: &DeviceId) -> String {
    format!("{root}/{device_id}/{REGISTRATION_SEGMENT}/{REPLY_SEGMENT}")
}

/// Renders the filter matching the registration requests of every end node.
#[must_use]
pub fn registration_filter(root: &str) -> String {
    format!("{root}/+/{REGISTRATION_SEGMENT}")
}

/// Extracts the device identifier from a registration request topic.
///
/// # Errors
///
/// A [`TopicError`] is returned when the topic is not shaped like
/// `{root}/{device}/registration`.
pub fn parse_registration(root: &str, topic: &str) -> Result<DeviceId, TopicError> {
    let rest = strip_root(root, topic)?;

    let mut segments = rest.split('/');

    let device_id = segments.next().ok_or(TopicError::Truncated)?;
    if device_id.is_empty() {
        return Err(TopicError::EmptyDeviceId);
    }

    if segments.next() != Some(REGISTRATION_SEGMENT) || segments.next().is_some() {
        return Err(TopicError::NotRegistration);
    }

    Ok(DeviceId::from(device_id))
}
