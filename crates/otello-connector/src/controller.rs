//! Device controllers.
//!
//! A [`DeviceController`] owns everything the connector keeps per end node:
//! the lifecycle machine, the adaptation session slot, the paths written by
//! past adaptations, the last-value cache, and the link over which the node
//! publications arrive.

use std::sync::Arc;

use bytes::Bytes;
use otello::description::NodeDescription;
use otello::forms::{FormOperation, Qos};
use otello::ota::{DeviceReport, OtaAction, REPORT_EVENT, ReportResult};
use otello::registration::EndNode;
use otello::source::{AppSource, ReplaceSet};
use otello::state::{NodeState, STATUS_PROPERTY, StatusUpdate};
use otello::topic::{AffordanceType, DeviceId, Namespace, TopicPath};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::adaptation::{AdaptationOptions, AdaptationOutcome};
use crate::cache::{MemoryCache, NodeCache};
use crate::error::{Error, ErrorKind, Result};
use crate::fsm::Fsm;
use crate::session::{AdaptationSession, OperationKind, OperationReply, SessionTimeouts};
use crate::transport::{
    InboundMessage, NodeLink, OUTBOX_CAPACITY, OutboundMessage, TransportOptions,
};

// Bound on application publications buffered per subscriber.
const BROADCAST_CAPACITY: usize = 16;

/// An application publication forwarded to controller subscribers.
#[derive(Debug, Clone)]
pub struct AppMessage {
    /// Identifier of the publishing end node.
    pub device_id: DeviceId,
    /// Affordance class of the publication.
    pub affordance: AffordanceType,
    /// Affordance name, possibly nested.
    pub name: String,
    /// Raw payload.
    pub payload: Bytes,
}

fn log_entry(id: String) -> impl Fn(NodeState, NodeState) -> core::result::Result<(), String> {
    move |from, to| {
        debug!("Node `{id}` moved from `{from}` to `{to}`");
        Ok(())
    }
}

// The lifecycle cycle: an adaptation leads back to the application through a
// restart, and a node may restart on its own from any contacted state.
fn lifecycle_fsm(id: &DeviceId) -> Fsm<NodeState> {
    let id = id.to_string();
    Fsm::builder(NodeState::Unknown)
        .edges(
            NodeState::Unknown,
            &[NodeState::Application, NodeState::Restarting],
        )
        .edges(
            NodeState::Application,
            &[NodeState::AdaptationPrep, NodeState::Restarting],
        )
        .edges(
            NodeState::AdaptationPrep,
            &[
                NodeState::Adaptation,
                NodeState::Application,
                NodeState::Restarting,
            ],
        )
        .edges(
            NodeState::Adaptation,
            &[NodeState::Application, NodeState::Restarting],
        )
        .edges(NodeState::Restarting, &[NodeState::Application])
        .on_enter(NodeState::Application, log_entry(id.clone()))
        .on_enter(NodeState::AdaptationPrep, log_entry(id.clone()))
        .on_enter(NodeState::Adaptation, log_entry(id.clone()))
        .on_enter(NodeState::Restarting, log_entry(id))
        .build()
}

pub(crate) struct NodeRuntime {
    pub(crate) fsm: Fsm<NodeState>,
    pub(crate) replace_set: ReplaceSet,
    pub(crate) session: Option<Arc<AdaptationSession>>,
}

pub(crate) struct ControllerInner {
    pub(crate) node: EndNode,
    pub(crate) options: TransportOptions,
    pub(crate) timeouts: SessionTimeouts,
    pub(crate) runtime: Mutex<NodeRuntime>,
    pub(crate) outbox: flume::Sender<OutboundMessage>,
    app_events: broadcast::Sender<AppMessage>,
    cache: Box<dyn NodeCache>,
}

impl ControllerInner {
    /// Routes one publication of the managed node.
    pub(crate) async fn handle_message(&self, message: InboundMessage) -> Result<()> {
        let path = TopicPath::parse(&self.options.root, &message.topic)
            .map_err(|e| Error::new(ErrorKind::MalformedTopic, format!("`{}`: {e}", message.topic)))?;

        if path.device_id != self.node.id {
            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                format!(
                    "publication of `{}` delivered to the controller of `{}`",
                    path.device_id, self.node.id
                ),
            ));
        }

        match path.namespace {
            Namespace::Core => self.handle_core(&path, &message.payload).await,
            Namespace::App => self.handle_app(path, message.payload).await,
        }
    }

    async fn handle_core(&self, path: &TopicPath, payload: &[u8]) -> Result<()> {
        match (path.affordance, path.name.as_str()) {
            (AffordanceType::Properties, STATUS_PROPERTY) => {
                let update: StatusUpdate = serde_json::from_slice(payload)?;
                self.apply_status(update.state).await
            }
            (AffordanceType::Events, REPORT_EVENT) => {
                let report: DeviceReport = serde_json::from_slice(payload)?;
                self.apply_report(report).await
            }
            _ => Err(Error::new(
                ErrorKind::ProtocolViolation,
                format!("unexpected core publication on `{}/{}`", path.affordance, path.name),
            )),
        }
    }

    /// Applies a status announcement to the lifecycle machine and settles the
    /// session operation the new state confirms, if any.
    async fn apply_status(&self, state: NodeState) -> Result<()> {
        let session = {
            let mut runtime = self.runtime.lock().await;

            if runtime.fsm.is(state) {
                debug!("Node `{}` announced `{state}` again", self.node.id);
                return Ok(());
            }

            runtime.fsm.transition(state)?;
            runtime.session.clone()
        };

        if let Some(session) = session {
            match state {
                NodeState::Adaptation => {
                    let _ = session
                        .resolve(OperationKind::Init, OperationReply::Acknowledged)
                        .await;
                }
                // A restart settles whichever finalization is in flight.
                NodeState::Restarting => {
                    if !session
                        .resolve(OperationKind::Commit, OperationReply::Acknowledged)
                        .await
                    {
                        let _ = session
                            .resolve(OperationKind::Rollback, OperationReply::Acknowledged)
                            .await;
                    }
                }
                NodeState::Application => {
                    let _ = session
                        .resolve(OperationKind::Rollback, OperationReply::Acknowledged)
                        .await;
                }
                NodeState::Unknown | NodeState::AdaptationPrep => {}
            }
        }

        Ok(())
    }

    async fn apply_report(&self, report: DeviceReport) -> Result<()> {
        let session = { self.runtime.lock().await.session.clone() };

        let Some(session) = session else {
            warn!("Node `{}` reported outside of a session", self.node.id);
            return Ok(());
        };

        let settled = match report.result {
            ReportResult::Written { written } => {
                session
                    .resolve(OperationKind::Write, OperationReply::Written(written))
                    .await
            }
            ReportResult::Deleted { deleted } => {
                session
                    .resolve(OperationKind::Delete, OperationReply::Deleted(deleted))
                    .await
            }
            ReportResult::Failed { message, .. } => session.fail_pending(&message).await > 0,
        };

        if !settled {
            debug!("Late report of `{}` absorbed", self.node.id);
        }

        Ok(())
    }

    /// Caches and forwards an application publication.
    ///
    /// The first application message of an uncontacted or restarting node
    /// doubles as a liveness signal and moves it to
    /// [`NodeState::Application`].
    async fn handle_app(&self, path: TopicPath, payload: Bytes) -> Result<()> {
        {
            let mut runtime = self.runtime.lock().await;
            match runtime.fsm.current() {
                NodeState::Adaptation => {
                    return Err(Error::new(
                        ErrorKind::InvalidState,
                        format!(
                            "application publication on `{}` while `{}` is being adapted",
                            path.name, self.node.id
                        ),
                    ));
                }
                NodeState::Unknown | NodeState::Restarting => {
                    runtime.fsm.transition(NodeState::Application)?;
                }
                NodeState::Application | NodeState::AdaptationPrep => {}
            }
        }

        self.cache
            .set(&format!("{}/{}", path.affordance, path.name), payload.clone());

        let _ = self.app_events.send(AppMessage {
            device_id: path.device_id,
            affordance: path.affordance,
            name: path.name,
            payload,
        });

        Ok(())
    }

    /// Publishes an adaptation action on the binding its description declares.
    pub(crate) async fn publish_action(&self, action: OtaAction) -> Result<()> {
        let name = action.name();

        let binding = self.node.description.action_binding(name).ok_or_else(|| {
            Error::new(
                ErrorKind::ProtocolViolation,
                format!("`{}` declares no form invoking `{name}`", self.node.id),
            )
        })?;

        let payload = action.to_payload()?;

        self.outbox
            .send_async(OutboundMessage::new(
                binding.topic,
                Bytes::from(payload),
                binding.qos,
                binding.retain,
            ))
            .await
            .map_err(|e| Error::new(ErrorKind::Transport, format!("link outbox closed: {e}")))?;

        Ok(())
    }

    /// Publishes the declared value of every property carrying one.
    ///
    /// Properties reachable only through a wildcard form have no concrete
    /// topic to publish on and are skipped.
    pub(crate) async fn publish_declared_values(&self) -> Result<()> {
        for (name, property) in &self.node.description.properties {
            let Some(value) = property.declared_value() else {
                continue;
            };

            let Some(binding) = property
                .forms
                .resolve(AffordanceType::Properties, FormOperation::ObserveProperty)
            else {
                debug!("Property `{name}` of `{}` declares no binding", self.node.id);
                continue;
            };

            if binding.has_wildcard() {
                debug!(
                    "Property `{name}` of `{}` is bound through a wildcard, not published",
                    self.node.id
                );
                continue;
            }

            let payload = serde_json::to_vec(value)?;

            self.outbox
                .send_async(OutboundMessage::new(
                    binding.topic,
                    Bytes::from(payload),
                    binding.qos,
                    binding.retain,
                ))
                .await
                .map_err(|e| Error::new(ErrorKind::Transport, format!("link outbox closed: {e}")))?;
        }

        Ok(())
    }

    // One filter per affordance class when the description binds it through a
    // wildcard, one filter per affordance otherwise.
    fn subscriptions(&self) -> Vec<(String, Qos)> {
        let description = &self.node.description;
        let mut subscriptions = Vec::new();

        for affordance in [AffordanceType::Properties, AffordanceType::Events] {
            if let Some(binding) = description.wildcard_binding(affordance) {
                subscriptions.push((binding.topic, binding.qos));
                continue;
            }

            let operation = match affordance {
                AffordanceType::Properties => FormOperation::ObserveProperty,
                _ => FormOperation::SubscribeEvent,
            };

            for (name, entry) in description.affordances(affordance) {
                match entry.forms.resolve(affordance, operation) {
                    Some(binding) => subscriptions.push((binding.topic, binding.qos)),
                    None => warn!(
                        "No form to observe the {affordance} `{name}` of `{}`",
                        self.node.id
                    ),
                }
            }
        }

        subscriptions
    }
}

/// The controller managing one end node.
pub struct DeviceController {
    pub(crate) inner: Arc<ControllerInner>,
    link: Mutex<Option<NodeLink>>,
    pub(crate) outbox_receiver: Mutex<Option<flume::Receiver<OutboundMessage>>>,
}

impl core::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceController")
            .field("node", &self.inner.node.id)
            .finish()
    }
}

impl DeviceController {
    /// Creates an unstarted [`DeviceController`] for an end node.
    #[must_use]
    pub fn new(node: EndNode, options: TransportOptions) -> Self {
        let (outbox, outbox_receiver) = flume::bounded(OUTBOX_CAPACITY);
        let (app_events, _) = broadcast::channel(BROADCAST_CAPACITY);

        let fsm = lifecycle_fsm(&node.id);

        Self {
            inner: Arc::new(ControllerInner {
                node,
                options,
                timeouts: SessionTimeouts::default(),
                runtime: Mutex::new(NodeRuntime {
                    fsm,
                    replace_set: ReplaceSet::new(),
                    session: None,
                }),
                outbox,
                app_events,
                cache: Box::new(MemoryCache::new()),
            }),
            link: Mutex::new(None),
            outbox_receiver: Mutex::new(Some(outbox_receiver)),
        }
    }

    /// Sets the session deadlines. Effective only before [`Self::start`].
    #[must_use]
    pub fn timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.timeouts = timeouts;
        }
        self
    }

    /// Replaces the last-value cache. Effective only before [`Self::start`].
    #[must_use]
    pub fn cache(mut self, cache: impl NodeCache + 'static) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.cache = Box::new(cache);
        }
        self
    }

    /// Returns the identifier of the managed node.
    #[must_use]
    pub fn id(&self) -> &DeviceId {
        &self.inner.node.id
    }

    /// Returns the description of the managed node.
    #[must_use]
    pub fn description(&self) -> &NodeDescription {
        &self.inner.node.description
    }

    /// Returns the current lifecycle state of the managed node.
    pub async fn state(&self) -> NodeState {
        self.inner.runtime.lock().await.fsm.current()
    }

    /// Subscribes to the application publications of the managed node.
    #[must_use]
    pub fn subscribe_app(&self) -> broadcast::Receiver<AppMessage> {
        self.inner.app_events.subscribe()
    }

    /// Returns the last cached payload for an `{affordance type}/{name}` key.
    #[must_use]
    pub fn cached(&self, key: &str) -> Option<Bytes> {
        self.inner.cache.get(key)
    }

    /// Connects the controller link and subscribes the node affordances.
    ///
    /// The declared value of every concrete property is published right
    /// after, so observers find the documented initial state on the broker.
    pub async fn start(&self) -> Result<()> {
        let receiver = self.outbox_receiver.lock().await.take().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidState,
                format!("controller `{}` was already started", self.inner.node.id),
            )
        })?;

        let client_id = format!("{}-connector-{}", self.inner.options.root, self.inner.node.id);
        let subscriptions = self.inner.subscriptions();

        let handler_inner = self.inner.clone();
        let link = NodeLink::connect(
            &client_id,
            &self.inner.options,
            subscriptions,
            receiver,
            move |message| {
                let inner = handler_inner.clone();
                async move {
                    // Failures are logged when the error is created.
                    let _ = inner.handle_message(message).await;
                }
            },
        )
        .await?;

        *self.link.lock().await = Some(link);

        self.inner.publish_declared_values().await?;

        info!("Controller `{}` started", self.inner.node.id);

        Ok(())
    }

    /// Starts an adaptation carrying the given application source.
    pub async fn start_adaptation(
        &self,
        source: AppSource,
        options: AdaptationOptions,
    ) -> Result<AdaptationOutcome> {
        crate::adaptation::run(&self.inner, source, options).await
    }

    /// Stops the controller, aborting any adaptation session still active.
    pub async fn stop(&self) {
        let session = { self.inner.runtime.lock().await.session.clone() };
        if let Some(session) = session {
            warn!(
                "Controller `{}` stopped with an adaptation session active",
                self.inner.node.id
            );
            session.abort("controller stopped").await;
        }

        if let Some(link) = self.link.lock().await.take() {
            link.stop().await;
        }

        info!("Controller `{}` stopped", self.inner.node.id);
    }
}
