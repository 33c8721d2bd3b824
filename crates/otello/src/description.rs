use alloc::string::String;

use hashbrown::DefaultHashBuilder;
use indexmap::IndexMap;

use serde::Serialize;
use serde_json::Value;

use crate::forms::{Binding, FormOperation, Forms};
use crate::topic::AffordanceType;

/// An insertion-ordered map of named affordances.
pub type Affordances = IndexMap<String, Affordance, DefaultHashBuilder>;

/// A single capability exposed by an end node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct Affordance {
    /// Forms binding this affordance to the transport.
    pub forms: Forms,
    /// Constant value declared for a property.
    #[serde(rename = "const", skip_serializing_if = "Option::is_none")]
    pub constant: Option<Value>,
    /// Default value declared for a property.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Whether a property can be observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observable: Option<bool>,
}

impl Affordance {
    /// Creates an [`Affordance`] from its [`Forms`].
    #[must_use]
    #[inline]
    pub const fn new(forms: Forms) -> Self {
        Self {
            forms,
            constant: None,
            default: None,
            observable: None,
        }
    }

    /// Sets the constant value.
    #[must_use]
    #[inline]
    pub fn constant(mut self, value: Value) -> Self {
        self.constant = Some(value);
        self
    }

    /// Sets the default value.
    #[must_use]
    #[inline]
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Marks the affordance as observable.
    #[must_use]
    #[inline]
    pub fn observable(mut self) -> Self {
        self.observable = Some(true);
        self
    }

    /// Returns the declared value of a property, preferring the constant
    /// over the default.
    #[must_use]
    pub fn declared_value(&self) -> Option<&Value> {
        self.constant.as_ref().or(self.default.as_ref())
    }
}

/// The capability description of an end node.
///
/// A connector fetches this document at registration time and derives every
/// subscription and publication from its forms.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct NodeDescription {
    /// Node title, matched against controller factories.
    pub title: String,
    /// Node version, matched against controller factories.
    pub version: String,
    /// Exposed properties.
    #[serde(skip_serializing_if = "Affordances::is_empty", default)]
    pub properties: Affordances,
    /// Exposed events.
    #[serde(skip_serializing_if = "Affordances::is_empty", default)]
    pub events: Affordances,
    /// Exposed actions.
    #[serde(skip_serializing_if = "Affordances::is_empty", default)]
    pub actions: Affordances,
    /// Top-level forms covering every property or event at once.
    #[serde(skip_serializing_if = "Forms::is_empty", default)]
    pub forms: Forms,
}

impl NodeDescription {
    /// Creates a [`NodeDescription`] without affordances.
    #[must_use]
    #[inline]
    pub fn new(title: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            version: version.into(),
            properties: Affordances::default(),
            events: Affordances::default(),
            actions: Affordances::default(),
            forms: Forms::new(),
        }
    }

    /// Adds a property [`Affordance`].
    #[must_use]
    #[inline]
    pub fn with_property(mut self, name: impl Into<String>, affordance: Affordance) -> Self {
        let _ = self.properties.insert(name.into(), affordance);
        self
    }

    /// Adds an event [`Affordance`].
    #[must_use]
    #[inline]
    pub fn with_event(mut self, name: impl Into<String>, affordance: Affordance) -> Self {
        let _ = self.events.insert(name.into(), affordance);
        self
    }

    /// Adds an action [`Affordance`].
    #[must_use]
    #[inline]
    pub fn with_action(mut self, name: impl Into<String>, affordance: Affordance) -> Self {
        let _ = self.actions.insert(name.into(), affordance);
        self
    }

    /// Sets the top-level [`Forms`].
    #[must_use]
    #[inline]
    pub fn with_forms(mut self, forms: Forms) -> Self {
        self.forms = forms;
        self
    }

    /// Returns the affordances of the given class.
    #[must_use]
    pub const fn affordances(&self, affordance: AffordanceType) -> &Affordances {
        match affordance {
            AffordanceType::Properties => &self.properties,
            AffordanceType::Events => &self.events,
            AffordanceType::Actions => &self.actions,
        }
    }

    /// Returns the named property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Affordance> {
        self.properties.get(name)
    }

    /// Returns the named event.
    #[must_use]
    pub fn event(&self, name: &str) -> Option<&Affordance> {
        self.events.get(name)
    }

    /// Returns the named action.
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&Affordance> {
        self.actions.get(name)
    }

    /// Resolves the top-level wildcard binding covering every affordance
    /// of the given class.
    ///
    /// Actions have no wildcard verb, so `None` is always returned for
    /// them.
    #[must_use]
    pub fn wildcard_binding(&self, affordance: AffordanceType) -> Option<Binding> {
        let operation = match affordance {
            AffordanceType::Properties => FormOperation::ObserveAllProperties,
            AffordanceType::Events => FormOperation::SubscribeAllEvents,
            AffordanceType::Actions => return None,
        };

        self.forms.resolve(affordance, operation)
    }

    /// Resolves the binding observing the named property.
    #[must_use]
    pub fn property_binding(&self, name: &str) -> Option<Binding> {
        self.property(name)?
            .forms
            .resolve(AffordanceType::Properties, FormOperation::ObserveProperty)
    }

    /// Resolves the binding subscribing to the named event.
    #[must_use]
    pub fn event_binding(&self, name: &str) -> Option<Binding> {
        self.event(name)?
            .forms
            .resolve(AffordanceType::Events, FormOperation::SubscribeEvent)
    }

    /// Resolves the binding invoking the named action.
    #[must_use]
    pub fn action_binding(&self, name: &str) -> Option<Binding> {
        self.action(name)?
            .forms
            .resolve(AffordanceType::Actions, FormOperation::InvokeAction)
    }
}

#[cfg(test)]
#[cfg(feature = "deserialize")]
mod tests {
    use serde_json::json;

    use crate::deserialize;
    use crate::forms::{Form, FormOperation, Forms, Qos};
    use crate::topic::AffordanceType;

    use super::{Affordance, NodeDescription};

    pub(crate) fn thermostat() -> NodeDescription {
        NodeDescription::new("thermostat", "1.2.0")
            .with_property(
                "status",
                Affordance::new(Forms::init(
                    Form::subscription(
                        FormOperation::ObserveProperty,
                        "otello/t1/properties/core/status",
                    )
                    .retain(true),
                ))
                .observable(),
            )
            .with_property(
                "setpoint",
                Affordance::new(Forms::init(Form::subscription(
                    FormOperation::ObserveProperty,
                    "otello/t1/properties/app/setpoint",
                )))
                .default_value(json!(20)),
            )
            .with_event(
                "report",
                Affordance::new(Forms::init(Form::subscription(
                    FormOperation::SubscribeEvent,
                    "otello/t1/events/core/report",
                ))),
            )
            .with_action(
                "OTAInit",
                Affordance::new(Forms::init(
                    Form::action("otello/t1/actions/core/OTAInit").qos(Qos::AtLeastOnce),
                )),
            )
    }

    #[test]
    fn lookup_and_resolve() {
        let description = thermostat();

        assert_eq!(
            description.property_binding("status").unwrap().topic,
            "otello/t1/properties/core/status"
        );
        assert_eq!(
            description.event_binding("report").unwrap().topic,
            "otello/t1/events/core/report"
        );

        let init = description.action_binding("OTAInit").unwrap();
        assert_eq!(init.topic, "otello/t1/actions/core/OTAInit");
        assert_eq!(init.qos, Qos::AtLeastOnce);

        assert_eq!(description.action_binding("OTAWrite"), None);
    }

    #[test]
    fn declared_values() {
        let description = thermostat();

        assert_eq!(
            description.property("setpoint").unwrap().declared_value(),
            Some(&json!(20))
        );
        assert_eq!(description.property("status").unwrap().declared_value(), None);
    }

    #[test]
    fn wildcard_preferred_form() {
        let description = thermostat().with_forms(Forms::init(Form::subscription(
            FormOperation::ObserveAllProperties,
            "otello/t1/properties/#",
        )));

        let binding = description
            .wildcard_binding(AffordanceType::Properties)
            .unwrap();
        assert_eq!(binding.topic, "otello/t1/properties/#");

        assert_eq!(description.wildcard_binding(AffordanceType::Events), None);
        assert_eq!(description.wildcard_binding(AffordanceType::Actions), None);
    }

    #[test]
    fn decode_manifest_document() {
        let description: NodeDescription = deserialize(json!({
            "title": "valve",
            "version": "0.3.1",
            "properties": {
                "status": {
                    "observable": true,
                    "forms": [{
                        "op": "observeproperty",
                        "mqv:filter": "otello/v9/properties/core/status",
                        "mqv:retain": true,
                    }],
                },
            },
            "actions": {
                "OTAFinish": {
                    "forms": [{
                        "op": ["invokeaction"],
                        "mqv:topic": "otello/v9/actions/core/OTAFinish",
                        "mqv:qos": 1,
                    }],
                },
            },
        }));

        assert_eq!(description.title, "valve");
        assert_eq!(description.version, "0.3.1");
        assert!(description.events.is_empty());

        let finish = description.action_binding("OTAFinish").unwrap();
        assert_eq!(finish.qos, Qos::AtLeastOnce);
    }
}
