use alloc::string::String;
use alloc::vec::Vec;

use core::fmt;

use serde::Serialize;

use crate::topic::AffordanceType;

/// Delivery guarantee requested for a binding.
///
/// Serialized as the protocol level `0`, `1`, or `2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Qos {
    /// Deliver at most once.
    #[default]
    AtMostOnce,
    /// Deliver at least once.
    AtLeastOnce,
    /// Deliver exactly once.
    ExactlyOnce,
}

impl Qos {
    /// Returns the protocol level of this [`Qos`].
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }

    /// Returns the [`Qos`] with the given protocol level.
    #[must_use]
    pub const fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }
}

impl Serialize for Qos {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.level())
    }
}

#[cfg(feature = "deserialize")]
impl<'de> serde::Deserialize<'de> for Qos {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let level = u8::deserialize(deserializer)?;
        Self::from_level(level)
            .ok_or_else(|| serde::de::Error::custom("quality of service level must be 0, 1, or 2"))
    }
}

/// Operation verbs a form can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
#[serde(rename_all = "lowercase")]
pub enum FormOperation {
    /// Observe a single property.
    ObserveProperty,
    /// Subscribe to a single event.
    SubscribeEvent,
    /// Invoke a single action.
    InvokeAction,
    /// Observe every property through one binding.
    ObserveAllProperties,
    /// Subscribe to every event through one binding.
    SubscribeAllEvents,
}

impl FormOperation {
    /// Returns a [`FormOperation`] name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ObserveProperty => "observeproperty",
            Self::SubscribeEvent => "subscribeevent",
            Self::InvokeAction => "invokeaction",
            Self::ObserveAllProperties => "observeallproperties",
            Self::SubscribeAllEvents => "subscribeallevents",
        }
    }
}

impl fmt::Display for FormOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

/// The operation verbs declared by a form.
///
/// Descriptions may declare a single verb as a bare string instead of an
/// array; both spellings decode to the same collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormOperations(Vec<FormOperation>);

impl FormOperations {
    /// Creates [`FormOperations`] containing a single verb.
    #[must_use]
    #[inline]
    pub fn init(operation: FormOperation) -> Self {
        let mut operations = Self(Vec::new());
        operations.add(operation);
        operations
    }

    /// Adds an operation verb.
    #[inline]
    pub fn add(&mut self, operation: FormOperation) {
        self.0.push(operation);
    }

    /// Checks whether the given verb is declared.
    #[must_use]
    #[inline]
    pub fn contains(&self, operation: FormOperation) -> bool {
        self.0.contains(&operation)
    }
}

#[cfg(feature = "deserialize")]
impl<'de> serde::Deserialize<'de> for FormOperations {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(FormOperation),
            Many(Vec<FormOperation>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(operation) => Self::init(operation),
            OneOrMany::Many(operations) => Self(operations),
        })
    }
}

/// The transport binding resolved from a form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Topic or filter to use on the wire.
    pub topic: String,
    /// Delivery guarantee hint.
    pub qos: Qos,
    /// Whether messages should be retained by the broker.
    pub retain: bool,
}

impl Binding {
    /// Checks whether the bound topic is a filter containing wildcards.
    ///
    /// A wildcard binding can be subscribed to but never published on.
    #[must_use]
    pub fn has_wildcard(&self) -> bool {
        self.topic.contains('+') || self.topic.contains('#')
    }
}

/// A form binding one or more operation verbs to a transport topic.
///
/// Property and event forms carry a filter-style topic key, action forms a
/// distinct topic key; the resolver picks the key matching the affordance
/// class.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct Form {
    /// Declared operation verbs.
    #[serde(rename = "op")]
    pub ops: FormOperations,
    /// Filter-style topic key used by property and event bindings.
    #[serde(rename = "mqv:filter", skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Topic key used by action bindings.
    #[serde(rename = "mqv:topic", skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Delivery guarantee hint.
    #[serde(rename = "mqv:qos", skip_serializing_if = "Option::is_none")]
    pub qos: Option<Qos>,
    /// Retain hint.
    #[serde(rename = "mqv:retain", skip_serializing_if = "Option::is_none")]
    pub retain: Option<bool>,
}

impl Form {
    /// Creates a [`Form`] binding a property or event verb to a filter.
    #[must_use]
    #[inline]
    pub fn subscription(operation: FormOperation, filter: impl Into<String>) -> Self {
        Self {
            ops: FormOperations::init(operation),
            filter: Some(filter.into()),
            topic: None,
            qos: None,
            retain: None,
        }
    }

    /// Creates a [`Form`] binding action invocations to a topic.
    #[must_use]
    #[inline]
    pub fn action(topic: impl Into<String>) -> Self {
        Self {
            ops: FormOperations::init(FormOperation::InvokeAction),
            filter: None,
            topic: Some(topic.into()),
            qos: None,
            retain: None,
        }
    }

    /// Sets the delivery guarantee hint.
    #[must_use]
    #[inline]
    pub fn qos(mut self, qos: Qos) -> Self {
        self.qos = Some(qos);
        self
    }

    /// Sets the retain hint.
    #[must_use]
    #[inline]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = Some(retain);
        self
    }

    // Resolves this form into a binding, when it serves the operation.
    fn binding(&self, affordance: AffordanceType, operation: FormOperation) -> Option<Binding> {
        if !self.ops.contains(operation) {
            return None;
        }

        let topic = match affordance {
            AffordanceType::Properties | AffordanceType::Events => self.filter.as_ref(),
            AffordanceType::Actions => self.topic.as_ref(),
        }?;

        Some(Binding {
            topic: topic.clone(),
            qos: self.qos.unwrap_or_default(),
            retain: self.retain.unwrap_or(false),
        })
    }
}

/// The ordered collection of forms declared by an affordance or description.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct Forms(Vec<Form>);

impl Forms {
    /// Creates an empty [`Forms`].
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Creates a [`Forms`] containing a single form.
    #[must_use]
    #[inline]
    pub fn init(form: Form) -> Self {
        Self::new().insert(form)
    }

    /// Inserts a form while constructing the collection.
    #[must_use]
    #[inline]
    pub fn insert(mut self, form: Form) -> Self {
        self.add(form);
        self
    }

    /// Adds a form.
    #[inline]
    pub fn add(&mut self, form: Form) {
        self.0.push(form);
    }

    /// Checks whether the collection is empty.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of forms.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns an iterator over the forms.
    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, Form> {
        self.0.iter()
    }

    /// Resolves the first form serving the given operation into a
    /// [`Binding`].
    ///
    /// `None` is returned when no declared form serves the operation or when
    /// the serving form lacks the topic key matching the affordance class.
    #[must_use]
    pub fn resolve(&self, affordance: AffordanceType, operation: FormOperation) -> Option<Binding> {
        self.0
            .iter()
            .find_map(|form| form.binding(affordance, operation))
    }
}

impl<'a> IntoIterator for &'a Forms {
    type Item = &'a Form;
    type IntoIter = core::slice::Iter<'a, Form>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
#[cfg(feature = "deserialize")]
mod tests {
    use serde_json::json;

    use crate::topic::AffordanceType;
    use crate::{deserialize, serialize};

    use super::{Binding, Form, FormOperation, Forms, Qos};

    #[test]
    fn resolve_property_binding() {
        let forms = Forms::init(
            Form::subscription(FormOperation::ObserveProperty, "otello/d/properties/core/status")
                .qos(Qos::AtLeastOnce)
                .retain(true),
        );

        assert_eq!(
            forms.resolve(AffordanceType::Properties, FormOperation::ObserveProperty),
            Some(Binding {
                topic: "otello/d/properties/core/status".into(),
                qos: Qos::AtLeastOnce,
                retain: true,
            })
        );
    }

    #[test]
    fn resolve_picks_first_serving_form() {
        let forms = Forms::new()
            .insert(Form::action("otello/d/actions/core/OTAInit"))
            .insert(Form::action("otello/d/actions/core/other"));

        let binding = forms
            .resolve(AffordanceType::Actions, FormOperation::InvokeAction)
            .unwrap();
        assert_eq!(binding.topic, "otello/d/actions/core/OTAInit");
        assert_eq!(binding.qos, Qos::AtMostOnce);
        assert!(!binding.retain);
    }

    #[test]
    fn resolve_missing_operation() {
        let forms = Forms::init(Form::action("otello/d/actions/core/OTAInit"));

        assert_eq!(
            forms.resolve(AffordanceType::Events, FormOperation::SubscribeEvent),
            None
        );
    }

    #[test]
    fn resolve_requires_matching_topic_key() {
        // An action form without the action topic key resolves to nothing,
        // even though the verb matches.
        let mut form = Form::action("otello/d/actions/core/OTAInit");
        form.topic = None;
        form.filter = Some("otello/d/actions/core/OTAInit".into());

        let forms = Forms::init(form);
        assert_eq!(
            forms.resolve(AffordanceType::Actions, FormOperation::InvokeAction),
            None
        );
    }

    #[test]
    fn wildcard_binding() {
        let forms = Forms::init(Form::subscription(
            FormOperation::ObserveAllProperties,
            "otello/d/properties/#",
        ));

        let binding = forms
            .resolve(AffordanceType::Properties, FormOperation::ObserveAllProperties)
            .unwrap();
        assert!(binding.has_wildcard());
    }

    #[test]
    fn form_wire_keys() {
        let form = Form::subscription(FormOperation::SubscribeEvent, "otello/d/events/core/report")
            .qos(Qos::AtLeastOnce);

        assert_eq!(
            serialize(&form),
            json!({
                "op": ["subscribeevent"],
                "mqv:filter": "otello/d/events/core/report",
                "mqv:qos": 1,
            })
        );
    }

    #[test]
    fn single_verb_as_bare_string() {
        let form: Form = deserialize(json!({
            "op": "invokeaction",
            "mqv:topic": "otello/d/actions/core/OTAFinish",
        }));

        assert!(form.ops.contains(FormOperation::InvokeAction));
        assert_eq!(form.topic.as_deref(), Some("otello/d/actions/core/OTAFinish"));
    }

    #[test]
    fn qos_levels() {
        assert_eq!(serialize(Qos::ExactlyOnce), json!(2));
        assert_eq!(deserialize::<Qos>(json!(0)), Qos::AtMostOnce);
        assert!(serde_json::from_value::<Qos>(json!(3)).is_err());
    }
}
