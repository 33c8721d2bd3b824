//! MQTT transport links.
//!
//! A [`NodeLink`] owns one client session towards the broker: a reader task
//! polls the event loop and hands every publication to a handler, while a
//! writer task drains an outbox of publications queued by the rest of the
//! crate. Both tasks stop through a shared cancellation token.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use otello::forms::Qos;
use otello::topic::DEFAULT_ROOT;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, MqttOptions};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::Result;

// Bound on in-flight requests towards the broker.
const ASYNC_CHANNEL_CAPACITY: usize = 10;

const KEEP_ALIVE_TIME: Duration = Duration::from_secs(5);

pub(crate) const OUTBOX_CAPACITY: usize = 32;

/// Broker connection parameters shared by every link a connector opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) root: String,
    pub(crate) keep_alive: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::new("localhost", 1883)
    }
}

impl TransportOptions {
    /// Creates [`TransportOptions`] for the given broker address.
    ///
    /// The topic root defaults to [`DEFAULT_ROOT`].
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            root: String::from(DEFAULT_ROOT),
            keep_alive: KEEP_ALIVE_TIME,
        }
    }

    /// Sets the topic root shared with the end nodes.
    #[must_use]
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets the keep-alive interval of every link.
    #[must_use]
    pub const fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// An outbound publication queued on a link outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OutboundMessage {
    pub(crate) topic: String,
    pub(crate) payload: Bytes,
    pub(crate) qos: Qos,
    pub(crate) retain: bool,
}

impl OutboundMessage {
    pub(crate) const fn new(topic: String, payload: Bytes, qos: Qos, retain: bool) -> Self {
        Self {
            topic,
            payload,
            qos,
            retain,
        }
    }
}

/// An inbound publication delivered by a link reader.
#[derive(Debug, Clone)]
pub(crate) struct InboundMessage {
    pub(crate) topic: String,
    pub(crate) payload: Bytes,
}

pub(crate) const fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn parse_inbound(event: core::result::Result<Event, ConnectionError>) -> Option<InboundMessage> {
    match event {
        Ok(Event::Incoming(Packet::Publish(publish))) => {
            match core::str::from_utf8(&publish.topic) {
                Ok(topic) => Some(InboundMessage {
                    topic: topic.to_owned(),
                    payload: publish.payload.clone(),
                }),
                Err(e) => {
                    warn!("Publication with a non UTF-8 topic dropped: {e}");
                    None
                }
            }
        }
        Ok(Event::Incoming(packet)) => {
            trace!("Incoming packet: {packet:?}");
            None
        }
        Ok(Event::Outgoing(outgoing)) => {
            trace!("Outgoing packet: {outgoing:?}");
            None
        }
        Err(e) => {
            error!("Connection error on the link: {e}");
            None
        }
    }
}

/// One client session towards the broker.
pub(crate) struct NodeLink {
    client: AsyncClient,
    cancellation_token: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl NodeLink {
    /// Connects to the broker, subscribes the given filters, and spawns the
    /// reader and writer tasks.
    pub(crate) async fn connect<H, F>(
        client_id: &str,
        options: &TransportOptions,
        subscriptions: Vec<(String, Qos)>,
        outbox: flume::Receiver<OutboundMessage>,
        handler: H,
    ) -> Result<Self>
    where
        H: Fn(InboundMessage) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let mut mqtt_options = MqttOptions::new(client_id, options.host.as_str(), options.port);
        let _ = mqtt_options.set_keep_alive(options.keep_alive);

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, ASYNC_CHANNEL_CAPACITY);

        for (filter, qos) in subscriptions {
            client.subscribe(filter, to_mqtt_qos(qos)).await?;
        }

        let cancellation_token = CancellationToken::new();

        let reader_token = cancellation_token.clone();
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_token.cancelled() => break,
                    event = event_loop.poll() => {
                        if let Some(message) = parse_inbound(event) {
                            handler(message).await;
                        }
                    }
                }
            }
        });

        let writer_token = cancellation_token.clone();
        let writer_client = client.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_token.cancelled() => break,
                    message = outbox.recv_async() => {
                        let Ok(message) = message else { break };
                        if let Err(e) = writer_client
                            .publish(
                                message.topic,
                                to_mqtt_qos(message.qos),
                                message.retain,
                                message.payload,
                            )
                            .await
                        {
                            error!("Failed to publish on the link: {e}");
                        }
                    }
                }
            }
        });

        Ok(Self {
            client,
            cancellation_token,
            reader,
            writer,
        })
    }

    /// Stops the link tasks and disconnects from the broker.
    pub(crate) async fn stop(self) {
        self.cancellation_token.cancel();

        if let Err(e) = self.client.disconnect().await {
            debug!("Link disconnect failed: {e}");
        }

        if let Err(e) = self.reader.await {
            error!("Failed to await the link reader task: {e}");
        }

        if let Err(e) = self.writer.await {
            error!("Failed to await the link writer task: {e}");
        }
    }
}
