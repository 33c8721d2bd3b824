//! The registration handshake.
//!
//! Every end node announces itself on `{root}/{device}/registration` with
//! the URL of its manifest. The connector acknowledges the request,
//! retrieves and decodes the manifest, builds a controller through the
//! factory matching the declared model, and reports the outcome on the
//! reply topic. A request replayed while its handshake is still running is
//! dropped whole.

use std::sync::Arc;

use bytes::Bytes;
use otello::description::NodeDescription;
use otello::forms::Qos;
use otello::registration::{EndNode, RegistrationReply, RegistrationRequest};
use otello::topic::{DeviceId, parse_registration, registration_reply_topic};
use tracing::{debug, info, warn};

use crate::connector::{Compat, ConnectorInner};
use crate::error::{Error, ErrorKind, Result};
use crate::transport::{InboundMessage, OutboundMessage};

pub(crate) async fn handle_registration(inner: &Arc<ConnectorInner>, message: InboundMessage) {
    let device_id = match parse_registration(&inner.options.root, &message.topic) {
        Ok(device_id) => device_id,
        Err(e) => {
            warn!(
                "Registration request on a malformed topic `{}`: {e}",
                message.topic
            );
            return;
        }
    };

    {
        let mut pending = inner.pending.lock().await;
        if !pending.insert(device_id.clone()) {
            debug!("Registration of `{device_id}` already in progress");
            return;
        }
    }

    handshake(inner, &device_id, &message.payload).await;

    let _ = inner.pending.lock().await.remove(&device_id);
}

async fn handshake(inner: &Arc<ConnectorInner>, device_id: &DeviceId, payload: &[u8]) {
    let request: RegistrationRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            reply(
                inner,
                device_id,
                RegistrationReply::error(format!("malformed registration request: {e}")),
            )
            .await;
            return;
        }
    };

    reply(inner, device_id, RegistrationReply::ack()).await;

    // A node which lost the broker connection registers again on reconnect.
    // Its controller is still in place, so only the outcome is re-announced.
    if inner.controllers.lock().await.contains_key(device_id) {
        info!("Node `{device_id}` re-registered");
        reply(inner, device_id, RegistrationReply::success(device_id.clone())).await;
        return;
    }

    match provision(inner, device_id, request).await {
        Ok(()) => {
            info!("Node `{device_id}` registered");
            reply(inner, device_id, RegistrationReply::success(device_id.clone())).await;
        }
        Err(e) => {
            reply(inner, device_id, RegistrationReply::error(e.to_string())).await;
        }
    }
}

async fn provision(
    inner: &Arc<ConnectorInner>,
    device_id: &DeviceId,
    request: RegistrationRequest,
) -> Result<()> {
    let description = fetch_manifest(inner, &request.manifest).await?;

    let compat = Compat::new(description.title.as_str(), description.version.as_str());
    let factory = inner
        .factories
        .lock()
        .await
        .get(&compat)
        .cloned()
        .ok_or_else(|| {
            Error::new(
                ErrorKind::Registration,
                format!("no controller factory serves {compat}"),
            )
        })?;

    let node = EndNode::new(device_id.clone(), description, request.extra);
    let controller = factory.create(node, &inner.options)?;

    if let Err(e) = controller.start().await {
        // Nothing of the half-started controller is retained.
        controller.stop().await;
        return Err(e);
    }

    let _ = inner
        .controllers
        .lock()
        .await
        .insert(device_id.clone(), Arc::new(controller));

    Ok(())
}

async fn fetch_manifest(inner: &ConnectorInner, url: &str) -> Result<NodeDescription> {
    let description = inner
        .http
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Ok(description)
}

async fn reply(inner: &ConnectorInner, device_id: &DeviceId, reply: RegistrationReply) {
    let topic = registration_reply_topic(&inner.options.root, device_id);

    let payload = match serde_json::to_vec(&reply) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Registration reply for `{device_id}` not encodable: {e}");
            return;
        }
    };

    if let Err(e) = inner
        .replies
        .send_async(OutboundMessage::new(
            topic,
            Bytes::from(payload),
            Qos::AtLeastOnce,
            false,
        ))
        .await
    {
        warn!("Registration reply for `{device_id}` dropped: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use otello::registration::{RegistrationReply, RegistrationRequest, RegistrationStatus};
    use otello::topic::DeviceId;
    use tokio::sync::Mutex;

    use crate::connector::ConnectorInner;
    use crate::tests::{TestBed, inbound};
    use crate::transport::{OutboundMessage, TransportOptions};

    use super::handle_registration;

    fn fixture() -> (Arc<ConnectorInner>, flume::Receiver<OutboundMessage>) {
        let (replies, receiver) = flume::bounded(8);

        let inner = Arc::new(ConnectorInner {
            options: TransportOptions::default(),
            factories: Mutex::new(HashMap::new()),
            controllers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            replies,
            http: reqwest::Client::new(),
        });

        (inner, receiver)
    }

    fn decode_reply(message: &OutboundMessage) -> RegistrationReply {
        serde_json::from_slice(&message.payload).unwrap()
    }

    #[tokio::test]
    async fn malformed_topic_is_dropped_without_a_reply() {
        let (inner, replies) = fixture();

        handle_registration(&inner, inbound("otello/n-7/registration/extra", b"{}".to_vec()))
            .await;

        assert!(replies.is_empty());
        assert!(inner.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_request_is_refused() {
        let (inner, replies) = fixture();

        handle_registration(
            &inner,
            inbound("otello/n-7/registration", b"not json".to_vec()),
        )
        .await;

        let message = replies.recv_async().await.unwrap();
        assert_eq!(message.topic, "otello/n-7/registration/reply");
        assert_eq!(decode_reply(&message).status, RegistrationStatus::Error);
        assert!(inner.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn known_node_is_acknowledged_and_confirmed() {
        let (inner, replies) = fixture();
        let bed = TestBed::new("n-7");
        let _ = inner
            .controllers
            .lock()
            .await
            .insert(DeviceId::new("n-7"), Arc::new(bed.controller));

        let request = RegistrationRequest::new("http://manifests.local/n-7");
        handle_registration(
            &inner,
            inbound(
                "otello/n-7/registration",
                serde_json::to_vec(&request).unwrap(),
            ),
        )
        .await;

        let ack = decode_reply(&replies.recv_async().await.unwrap());
        assert_eq!(ack.status, RegistrationStatus::Ack);

        let confirmation = decode_reply(&replies.recv_async().await.unwrap());
        assert_eq!(confirmation.status, RegistrationStatus::Success);
        assert_eq!(confirmation.id, Some(DeviceId::new("n-7")));
    }

    #[tokio::test]
    async fn replayed_request_is_dropped_while_the_handshake_runs() {
        let (inner, replies) = fixture();
        assert!(inner.pending.lock().await.insert(DeviceId::new("n-7")));

        let request = RegistrationRequest::new("http://manifests.local/n-7");
        handle_registration(
            &inner,
            inbound(
                "otello/n-7/registration",
                serde_json::to_vec(&request).unwrap(),
            ),
        )
        .await;

        assert!(replies.is_empty());
        // The in-flight handshake still owns the pending entry.
        assert!(inner.pending.lock().await.contains(&DeviceId::new("n-7")));
    }

    #[tokio::test]
    async fn unreachable_manifest_fails_the_handshake() {
        let (inner, replies) = fixture();

        // Port 9 is unassigned on loopback, the fetch fails immediately.
        let request = RegistrationRequest::new("http://127.0.0.1:9/manifest");
        handle_registration(
            &inner,
            inbound(
                "otello/n-9/registration",
                serde_json::to_vec(&request).unwrap(),
            ),
        )
        .await;

        let ack = decode_reply(&replies.recv_async().await.unwrap());
        assert_eq!(ack.status, RegistrationStatus::Ack);

        let refusal = decode_reply(&replies.recv_async().await.unwrap());
        assert_eq!(refusal.status, RegistrationStatus::Error);
        assert!(refusal.message.is_some());
        assert!(inner.pending.lock().await.is_empty());
    }
}
