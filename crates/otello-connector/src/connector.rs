//! The edge connector.
//!
//! An [`EdgeConnector`] is the single process-wide entry point: it listens
//! for registration requests, keeps one [`DeviceController`] per adopted end
//! node, and exposes fleet-level operations such as adapting a node or
//! stopping everything at once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use otello::forms::Qos;
use otello::registration::EndNode;
use otello::source::AppSource;
use otello::topic::{DeviceId, registration_filter};
use tokio::sync::Mutex;
use tracing::info;

use crate::adaptation::{AdaptationOptions, AdaptationOutcome};
use crate::controller::DeviceController;
use crate::error::{Error, ErrorKind, Result};
use crate::registration::handle_registration;
use crate::session::SessionTimeouts;
use crate::transport::{NodeLink, OUTBOX_CAPACITY, OutboundMessage, TransportOptions};

/// The compatibility key a controller factory serves.
///
/// Registration matches the `title` and `version` declared by a node
/// manifest against the registered keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Compat {
    title: String,
    version: String,
}

impl Compat {
    /// Creates a [`Compat`] key from a model title and version.
    #[must_use]
    pub fn new(title: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            version: version.into(),
        }
    }
}

impl core::fmt::Display for Compat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "`{}` v{}", self.title, self.version)
    }
}

/// Builds controllers for the end nodes matching one compatibility key.
pub trait ControllerFactory: Send + Sync {
    /// Builds an unstarted controller for a registered end node.
    fn create(&self, node: EndNode, options: &TransportOptions) -> Result<DeviceController>;
}

/// The [`ControllerFactory`] serving models with no custom behavior.
#[derive(Debug, Clone, Default)]
pub struct DefaultControllerFactory {
    timeouts: SessionTimeouts,
}

impl DefaultControllerFactory {
    /// Creates a [`DefaultControllerFactory`] with default session deadlines.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the session deadlines of every controller built by this factory.
    #[must_use]
    pub fn timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl ControllerFactory for DefaultControllerFactory {
    fn create(&self, node: EndNode, options: &TransportOptions) -> Result<DeviceController> {
        Ok(DeviceController::new(node, options.clone()).timeouts(self.timeouts.clone()))
    }
}

pub(crate) struct ConnectorInner {
    pub(crate) options: TransportOptions,
    pub(crate) factories: Mutex<HashMap<Compat, Arc<dyn ControllerFactory>>>,
    pub(crate) controllers: Mutex<HashMap<DeviceId, Arc<DeviceController>>>,
    pub(crate) pending: Mutex<HashSet<DeviceId>>,
    pub(crate) replies: flume::Sender<OutboundMessage>,
    pub(crate) http: reqwest::Client,
}

/// The connector adopting and adapting every end node of a fleet.
pub struct EdgeConnector {
    pub(crate) inner: Arc<ConnectorInner>,
    listener: Mutex<Option<NodeLink>>,
    replies_receiver: Mutex<Option<flume::Receiver<OutboundMessage>>>,
}

impl core::fmt::Debug for EdgeConnector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EdgeConnector")
            .field("root", &self.inner.options.root)
            .finish()
    }
}

impl EdgeConnector {
    /// Creates a stopped [`EdgeConnector`].
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        let (replies, replies_receiver) = flume::bounded(OUTBOX_CAPACITY);

        Self {
            inner: Arc::new(ConnectorInner {
                options,
                factories: Mutex::new(HashMap::new()),
                controllers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashSet::new()),
                replies,
                http: reqwest::Client::new(),
            }),
            listener: Mutex::new(None),
            replies_receiver: Mutex::new(Some(replies_receiver)),
        }
    }

    /// Registers the controller factory serving a compatibility key.
    ///
    /// At most one factory can serve a key.
    pub async fn register_controller_factory(
        &self,
        compat: Compat,
        factory: impl ControllerFactory + 'static,
    ) -> Result<()> {
        let mut factories = self.inner.factories.lock().await;

        if factories.contains_key(&compat) {
            return Err(Error::new(
                ErrorKind::DuplicateFactory,
                format!("a factory for {compat} is already registered"),
            ));
        }

        info!("Factory for {compat} registered");
        let _ = factories.insert(compat, Arc::new(factory));

        Ok(())
    }

    /// Connects to the broker and starts listening for registrations.
    pub async fn start(&self) -> Result<()> {
        let receiver = self.replies_receiver.lock().await.take().ok_or_else(|| {
            Error::new(ErrorKind::InvalidState, "the connector was already started")
        })?;

        let client_id = format!("{}-connector-registrar", self.inner.options.root);
        let subscriptions = vec![(
            registration_filter(&self.inner.options.root),
            Qos::AtLeastOnce,
        )];

        let handler_inner = self.inner.clone();
        let listener = NodeLink::connect(
            &client_id,
            &self.inner.options,
            subscriptions,
            receiver,
            move |message| {
                let inner = handler_inner.clone();
                async move {
                    // Handshakes run concurrently, one task per request.
                    drop(tokio::spawn(async move {
                        handle_registration(&inner, message).await;
                    }));
                }
            },
        )
        .await?;

        *self.listener.lock().await = Some(listener);

        info!(
            "Connector listening for registrations under `{}`",
            self.inner.options.root
        );

        Ok(())
    }

    /// Returns the controller of a registered end node.
    pub async fn controller(&self, id: &DeviceId) -> Option<Arc<DeviceController>> {
        self.inner.controllers.lock().await.get(id).cloned()
    }

    /// Adapts the application of a registered end node.
    pub async fn adapt_end_node(
        &self,
        id: &DeviceId,
        source: AppSource,
        options: AdaptationOptions,
    ) -> Result<AdaptationOutcome> {
        let controller = self.controller(id).await.ok_or_else(|| {
            Error::new(
                ErrorKind::ControllerNotFound,
                format!("no controller is managing `{id}`"),
            )
        })?;

        controller.start_adaptation(source, options).await
    }

    /// Stops the registration listener and every controller.
    pub async fn stop(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.stop().await;
        }

        let controllers: Vec<_> = self.inner.controllers.lock().await.drain().collect();

        let stops = controllers.into_iter().map(|(id, controller)| async move {
            controller.stop().await;
            info!("Controller `{id}` released");
        });
        let _: Vec<()> = join_all(stops).await;

        info!("Connector stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use otello::topic::DeviceId;

    use crate::adaptation::AdaptationOptions;
    use crate::error::ErrorKind;
    use crate::tests::{TestBed, app_source};
    use crate::transport::TransportOptions;

    use super::{Compat, DefaultControllerFactory, EdgeConnector};

    #[tokio::test]
    async fn one_factory_per_compatibility_key() {
        let connector = EdgeConnector::new(TransportOptions::default());
        let compat = Compat::new("thermostat", "1.2.0");

        connector
            .register_controller_factory(compat.clone(), DefaultControllerFactory::new())
            .await
            .unwrap();

        let error = connector
            .register_controller_factory(compat, DefaultControllerFactory::new())
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::DuplicateFactory);
    }

    #[tokio::test]
    async fn factories_for_distinct_keys_coexist() {
        let connector = EdgeConnector::new(TransportOptions::default());

        connector
            .register_controller_factory(
                Compat::new("thermostat", "1.2.0"),
                DefaultControllerFactory::new(),
            )
            .await
            .unwrap();
        connector
            .register_controller_factory(
                Compat::new("thermostat", "2.0.0"),
                DefaultControllerFactory::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn adapting_an_unmanaged_node_fails() {
        let connector = EdgeConnector::new(TransportOptions::default());

        let error = connector
            .adapt_end_node(
                &DeviceId::new("ghost"),
                app_source(&[("main.py", b"print('hi')")]),
                AdaptationOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::ControllerNotFound);
    }

    #[tokio::test]
    async fn controllers_are_looked_up_by_device_id() {
        let connector = EdgeConnector::new(TransportOptions::default());
        let bed = TestBed::new("thermo-1");
        let id = bed.controller.id().clone();

        let _ = connector
            .inner
            .controllers
            .lock()
            .await
            .insert(id.clone(), Arc::new(bed.controller));

        assert!(connector.controller(&id).await.is_some());
        assert!(connector.controller(&DeviceId::new("thermo-2")).await.is_none());
    }
}
