//! Context passed to message handlers.
//!
//! Carries the delivered message and a handle for sending follow-up
//! messages. Anything sent through the context inherits the correlation id
//! of the message being handled unless the caller set one explicitly.

use crate::error::BusError;
use crate::message::{headers, Envelope, Message, TransportMessage};
use crate::producer::{encode_envelope, send_envelope, Outbound};
use crate::serializer::{JsonSerializer, Serializer};

/// The context passed to every handler, process manager and aggregator.
///
/// ## Example
///
/// ```ignore
/// fn handle(order: OrderPlaced, ctx: &Context) -> Result<(), HandlerError> {
///     ctx.send(ChargeCard { order_id: order.id })?;
///     Ok(())
/// }
/// ```
pub struct Context<'a, S: Serializer = JsonSerializer> {
    message: &'a TransportMessage,
    queue: &'a str,
    serializer: &'a S,
    outbound: &'a dyn Outbound,
}

impl<'a, S: Serializer> Context<'a, S> {
    pub fn new(
        message: &'a TransportMessage,
        queue: &'a str,
        serializer: &'a S,
        outbound: &'a dyn Outbound,
    ) -> Self {
        Self {
            message,
            queue,
            serializer,
            outbound,
        }
    }

    /// The raw message being handled.
    pub fn message(&self) -> &TransportMessage {
        self.message
    }

    pub fn message_id(&self) -> &str {
        self.message.id()
    }

    pub fn correlation_id(&self) -> &str {
        self.message.correlation_id()
    }

    pub fn message_type(&self) -> &str {
        self.message.message_type()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.message.header(name)
    }

    /// The queue the message was delivered on.
    pub fn queue(&self) -> &str {
        self.queue
    }

    pub fn retry_count(&self) -> u32 {
        self.message.retry_count()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.message.reply_to()
    }

    /// Deserialize the payload into `M`.
    pub fn decode<M: Message>(&self) -> Result<M, BusError> {
        self.serializer
            .deserialize(&self.message.payload, self.message.message_type())
    }

    /// Send to the queues mapped for `M`.
    pub fn send<M: Message>(&self, envelope: impl Into<Envelope<M>>) -> Result<(), BusError> {
        let envelope = self.correlate(envelope.into());
        send_envelope(self.outbound, self.serializer, &envelope)
    }

    pub fn send_to<M: Message>(
        &self,
        queue: &str,
        envelope: impl Into<Envelope<M>>,
    ) -> Result<(), BusError> {
        let envelope = self.correlate(envelope.into());
        let message = encode_envelope(self.serializer, &envelope, self.outbound.max_message_size())?;
        self.outbound.send_message(queue, message)
    }

    pub fn publish<M: Message>(&self, envelope: impl Into<Envelope<M>>) -> Result<usize, BusError> {
        let envelope = self.correlate(envelope.into());
        let message = encode_envelope(self.serializer, &envelope, self.outbound.max_message_size())?;
        self.outbound.publish_message(M::type_name(), message)
    }

    /// Answer the request being handled.
    ///
    /// The reply goes to the request's reply-to queue and always carries the
    /// request's correlation id.
    pub fn reply<M: Message>(&self, envelope: impl Into<Envelope<M>>) -> Result<(), BusError> {
        let reply_to = self.reply_to().ok_or_else(|| {
            BusError::InvalidMessage(format!(
                "message {} has no {} header to reply to",
                self.message_id(),
                headers::REPLY_TO
            ))
        })?;
        let envelope = envelope.into().with_correlation_id(self.correlation_id());
        let mut message =
            encode_envelope(self.serializer, &envelope, self.outbound.max_message_size())?;
        message.set_header(headers::INTENT, headers::INTENT_REPLY);
        self.outbound.send_message(reply_to, message)
    }

    fn correlate<M>(&self, envelope: Envelope<M>) -> Envelope<M> {
        if envelope.has_explicit_correlation() {
            envelope
        } else {
            envelope.with_correlation_id(self.correlation_id())
        }
    }
}
