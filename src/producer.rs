//! Outbound side of the bus: point-to-point sends and topic publishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BusError;
use crate::message::{headers, Envelope, Message, TransportMessage};
use crate::serializer::Serializer;
use crate::settings::{QueueMappings, TransportSettings};
use crate::error::TransportError;
use crate::transport::Transport;

/// Reconnect attempts a single send makes before giving up on a lost
/// connection.
const RECONNECT_ATTEMPTS: u32 = 5;

/// Type name used for heartbeat messages.
pub const HEARTBEAT_TYPE: &str = "Heartbeat";

/// Object-safe view of a producer, used by handler contexts to send
/// follow-up messages without knowing the transport type.
pub trait Outbound: Send + Sync {
    fn send_message(&self, queue: &str, message: TransportMessage) -> Result<(), BusError>;

    fn publish_message(&self, topic: &str, message: TransportMessage) -> Result<usize, BusError>;

    /// Queues a message of this type is sent to when no endpoint is given.
    fn destinations(&self, message_type: &str) -> Vec<String>;

    /// The bus's own queue.
    fn local_queue(&self) -> &str;

    fn max_message_size(&self) -> usize;
}

/// Serialize an envelope into a transport message with identity headers.
///
/// Caller headers may not use reserved names, and the encoded payload must
/// fit within `max_size`.
pub(crate) fn encode_envelope<M: Message, S: Serializer>(
    serializer: &S,
    envelope: &Envelope<M>,
    max_size: usize,
) -> Result<TransportMessage, BusError> {
    if let Some(name) = envelope.headers().keys().find(|k| headers::is_reserved(k)) {
        return Err(BusError::HeaderCollision(name.clone()));
    }

    let payload = serializer.serialize(envelope.body(), M::type_name())?;
    if payload.len() > max_size {
        return Err(BusError::PayloadTooLarge {
            size: payload.len(),
            max: max_size,
        });
    }

    let mut message = TransportMessage::new(
        envelope.id(),
        M::type_name(),
        envelope.correlation_id(),
        payload,
    );
    message.set_header(headers::CONTENT_TYPE, serializer.content_type());
    message.set_header(headers::SENT_AT, now_millis().to_string());
    for (key, value) in envelope.headers() {
        message.set_header(key.clone(), value.clone());
    }
    Ok(message)
}

/// Encode once and send to every mapped destination, in mapping order.
pub(crate) fn send_envelope<M: Message, S: Serializer>(
    outbound: &dyn Outbound,
    serializer: &S,
    envelope: &Envelope<M>,
) -> Result<(), BusError> {
    let message = encode_envelope(serializer, envelope, outbound.max_message_size())?;
    for queue in outbound.destinations(M::type_name()) {
        outbound.send_message(&queue, message.clone())?;
    }
    Ok(())
}

pub(crate) fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Sends and publishes messages over a [`Transport`].
pub struct Producer<T: Transport, S: Serializer> {
    transport: Arc<T>,
    serializer: Arc<S>,
    settings: Arc<TransportSettings>,
    mappings: Arc<QueueMappings>,
    disconnected: AtomicBool,
}

impl<T: Transport, S: Serializer> Producer<T, S> {
    pub fn new(
        transport: Arc<T>,
        serializer: Arc<S>,
        settings: Arc<TransportSettings>,
        mappings: Arc<QueueMappings>,
    ) -> Self {
        Self {
            transport,
            serializer,
            settings,
            mappings,
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Send to the queues mapped for `M`, or to the bus's own queue when
    /// there is no mapping.
    pub fn send<M: Message>(&self, envelope: impl Into<Envelope<M>>) -> Result<(), BusError> {
        send_envelope(self, &*self.serializer, &envelope.into())
    }

    /// Send to one explicit queue, bypassing the mappings.
    pub fn send_to<M: Message>(
        &self,
        queue: &str,
        envelope: impl Into<Envelope<M>>,
    ) -> Result<(), BusError> {
        let message = self.encode(&envelope.into())?;
        self.send_message(queue, message)
    }

    /// Publish on the topic named after `M`. Returns how many queues
    /// received a copy.
    pub fn publish<M: Message>(&self, envelope: impl Into<Envelope<M>>) -> Result<usize, BusError> {
        let message = self.encode(&envelope.into())?;
        self.publish_message(M::type_name(), message)
    }

    /// Send pre-serialized bytes.
    ///
    /// The message must name its type. A missing message id is generated
    /// and a missing correlation id defaults to the message id.
    pub fn send_bytes(&self, queue: &str, mut message: TransportMessage) -> Result<(), BusError> {
        if message.message_type().is_empty() {
            return Err(BusError::InvalidMessage(format!(
                "message sent to {} has no {} header",
                queue,
                headers::MESSAGE_TYPE
            )));
        }
        if message.id().is_empty() {
            message.set_header(headers::MESSAGE_ID, Uuid::new_v4().to_string());
        }
        if message.header(headers::CORRELATION_ID).is_none() {
            let id = message.id().to_string();
            message.set_header(headers::CORRELATION_ID, id);
        }
        let max = Outbound::max_message_size(self);
        if message.payload.len() > max {
            return Err(BusError::PayloadTooLarge {
                size: message.payload.len(),
                max,
            });
        }
        self.send_message(queue, message)
    }

    pub fn encode<M: Message>(&self, envelope: &Envelope<M>) -> Result<TransportMessage, BusError> {
        encode_envelope(&*self.serializer, envelope, Outbound::max_message_size(self))
    }

    /// Write a heartbeat to the configured heartbeat queue. Does nothing
    /// when none is configured.
    pub fn send_heartbeat(&self) -> Result<(), BusError> {
        let Some(queue) = self.settings.heartbeat_queue.as_deref() else {
            return Ok(());
        };
        let payload = serde_json::json!({
            "queue": self.settings.queue_name,
            "sent_at_ms": now_millis() as u64,
        });
        let id = Uuid::new_v4().to_string();
        let message = TransportMessage::new(
            id.clone(),
            HEARTBEAT_TYPE,
            id,
            payload.to_string().into_bytes(),
        )
        .with_header(headers::CONTENT_TYPE, "application/json");
        self.send_message(queue, message)
    }

    /// Stop accepting sends. Idempotent.
    pub fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            info!(queue = %self.settings.queue_name, "producer disconnected");
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        if self.is_disconnected() {
            Err(BusError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Run `op`, re-establishing the connection with exponential backoff
    /// when it reports `ConnectionLost`. The last failure surfaces once
    /// the attempts run out.
    fn with_reconnect<R>(
        &self,
        mut op: impl FnMut(&T) -> Result<R, TransportError>,
    ) -> Result<R, BusError> {
        let mut backoff = self.settings.reconnect_initial_backoff;
        let mut attempt = 0;
        loop {
            match op(&*self.transport) {
                Err(TransportError::ConnectionLost(reason)) if attempt < RECONNECT_ATTEMPTS => {
                    attempt += 1;
                    warn!(
                        queue = %self.settings.queue_name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %reason,
                        "outbound connection lost, reconnecting"
                    );
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2).min(self.settings.reconnect_max_backoff);
                    self.ensure_connected()?;
                    if let Err(err) = self.transport.reconnect() {
                        if matches!(err, TransportError::Closed) {
                            return Err(err.into());
                        }
                        debug!(error = %err, "reconnect attempt failed");
                    }
                }
                result => return result.map_err(BusError::from),
            }
        }
    }
}

impl<T: Transport, S: Serializer> Outbound for Producer<T, S> {
    fn send_message(&self, queue: &str, message: TransportMessage) -> Result<(), BusError> {
        self.ensure_connected()?;
        debug!(
            queue,
            message_id = message.id(),
            message_type = message.message_type(),
            correlation_id = message.correlation_id(),
            "sending message"
        );
        self.with_reconnect(|transport| transport.send(queue, message.clone()))
    }

    fn publish_message(&self, topic: &str, message: TransportMessage) -> Result<usize, BusError> {
        self.ensure_connected()?;
        let message_id = message.id().to_string();
        let delivered = self.with_reconnect(|transport| transport.publish(topic, message.clone()))?;
        debug!(topic, message_id = %message_id, delivered, "published message");
        Ok(delivered)
    }

    fn destinations(&self, message_type: &str) -> Vec<String> {
        match self.mappings.destinations(message_type) {
            Some(queues) => queues.to_vec(),
            None => vec![self.settings.queue_name.clone()],
        }
    }

    fn local_queue(&self) -> &str {
        &self.settings.queue_name
    }

    fn max_message_size(&self) -> usize {
        let transport_max = self.transport.max_message_size();
        self.settings
            .max_message_size
            .map_or(transport_max, |configured| configured.min(transport_max))
    }
}
