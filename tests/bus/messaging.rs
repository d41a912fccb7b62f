//! Send, publish, audit and poison-message routing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sourced_bus::transport::InMemoryTransport;
use sourced_bus::{headers, Bus, BusError, Context, Envelope, HandlerError, TransportMessage};

use crate::support::{order, settings, wait_until, OrderPlaced, PaymentReceived, WAIT};

#[test]
fn mapped_send_reaches_every_queue_with_one_identity() {
    let transport = InMemoryTransport::new();
    let orders = Bus::builder(settings("orders"), transport.clone())
        .map::<OrderPlaced>("billing")
        .map::<OrderPlaced>("shipping")
        .build()
        .unwrap();

    let envelope = Envelope::new(order("o-1"));
    let id = envelope.id().to_string();
    orders.send(envelope).unwrap();

    let billing = transport.messages("billing");
    let shipping = transport.messages("shipping");
    assert_eq!(billing.len(), 1);
    assert_eq!(shipping.len(), 1);
    assert_eq!(billing[0].id(), id);
    assert_eq!(shipping[0].id(), id);
    assert_eq!(billing[0].message_type(), "OrderPlaced");
    assert_eq!(billing[0].correlation_id(), id);
    assert!(transport.is_empty("orders"));
}

#[test]
fn unmapped_send_goes_to_own_queue() {
    let transport = InMemoryTransport::new();
    let bus = Bus::builder(settings("orders"), transport.clone())
        .build()
        .unwrap();

    bus.send(order("o-1")).unwrap();

    assert_eq!(transport.len("orders"), 1);
}

#[test]
fn handled_message_is_acknowledged_exactly_once() {
    let transport = InMemoryTransport::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let billing = Bus::builder(settings("billing"), transport.clone())
        .handle_fn(move |order: OrderPlaced, _ctx: &Context| -> Result<(), HandlerError> {
            sink.lock().unwrap().push(order.order_id);
            Ok(())
        })
        .build()
        .unwrap();
    billing.start_consuming().unwrap();

    let orders = Bus::builder(settings("orders"), transport.clone())
        .map::<OrderPlaced>("billing")
        .build()
        .unwrap();
    let envelope = Envelope::new(order("o-7"));
    let id = envelope.id().to_string();
    orders.send(envelope).unwrap();

    assert!(wait_until(WAIT, || transport.acknowledged().contains(&id)));
    billing.stop_consuming();

    assert_eq!(*seen.lock().unwrap(), vec!["o-7".to_string()]);
    let acks = transport.acknowledged();
    assert_eq!(acks.iter().filter(|acked| **acked == id).count(), 1);
    assert_eq!(transport.unacked_count("billing"), 0);
    assert!(transport.is_empty("errors"));
}

#[test]
fn publish_reaches_every_subscribed_bus() {
    let transport = InMemoryTransport::new();
    let count = Arc::new(Mutex::new(Vec::new()));

    let mut subscribers = Vec::new();
    for queue in ["billing", "shipping"] {
        let sink = Arc::clone(&count);
        let bus = Bus::builder(settings(queue), transport.clone())
            .handle_fn(move |_: OrderPlaced, ctx: &Context| -> Result<(), HandlerError> {
                sink.lock().unwrap().push(ctx.queue().to_string());
                Ok(())
            })
            .build()
            .unwrap();
        bus.start_consuming().unwrap();
        subscribers.push(bus);
    }

    let orders = Bus::builder(settings("orders"), transport.clone())
        .build()
        .unwrap();
    let received = orders.publish(order("o-1")).unwrap();

    assert_eq!(received, 2);
    assert!(wait_until(WAIT, || count.lock().unwrap().len() == 2));
    let mut queues = count.lock().unwrap().clone();
    queues.sort();
    assert_eq!(queues, vec!["billing".to_string(), "shipping".to_string()]);
}

#[test]
fn publish_without_subscribers_reaches_nobody() {
    let transport = InMemoryTransport::new();
    let orders = Bus::builder(settings("orders"), transport.clone())
        .build()
        .unwrap();

    assert_eq!(orders.publish(order("o-1")).unwrap(), 0);
}

#[test]
fn follow_up_sends_inherit_the_correlation_id() {
    let transport = InMemoryTransport::new();
    let billing = Bus::builder(settings("billing"), transport.clone())
        .map::<PaymentReceived>("payments")
        .handle_fn(|order: OrderPlaced, ctx: &Context| -> Result<(), HandlerError> {
            ctx.send(PaymentReceived {
                order_id: order.order_id,
                amount: order.total,
            })?;
            Ok(())
        })
        .build()
        .unwrap();
    billing.start_consuming().unwrap();

    billing
        .send_to("billing", Envelope::new(order("o-1")).with_correlation_id("checkout-42"))
        .unwrap();

    assert!(transport.wait_for_len("payments", 1, WAIT));
    let payment = &transport.messages("payments")[0];
    assert_eq!(payment.correlation_id(), "checkout-42");
    assert_eq!(payment.message_type(), "PaymentReceived");
}

#[test]
fn auditing_mirrors_handled_messages() {
    let transport = InMemoryTransport::new();
    let billing = Bus::builder(settings("billing").with_auditing(true), transport.clone())
        .handle_fn(|_: OrderPlaced, _: &Context| -> Result<(), HandlerError> { Ok(()) })
        .build()
        .unwrap();
    billing.start_consuming().unwrap();

    let envelope = Envelope::new(order("o-1"));
    let id = envelope.id().to_string();
    billing.send_to("billing", envelope).unwrap();

    assert!(transport.wait_for_len("audit", 1, WAIT));
    let audited = &transport.messages("audit")[0];
    assert_eq!(audited.id(), id);
    assert_eq!(audited.header(headers::SOURCE_QUEUE), Some("billing"));
}

#[test]
fn poison_message_goes_straight_to_the_error_queue() {
    let transport = InMemoryTransport::new();
    let calls = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&calls);

    let billing = Bus::builder(settings("billing"), transport.clone())
        .handle_fn(move |_: OrderPlaced, _: &Context| -> Result<(), HandlerError> {
            *counter.lock().unwrap() += 1;
            Ok(())
        })
        .build()
        .unwrap();
    billing.start_consuming().unwrap();

    billing
        .send_bytes(
            "billing",
            TransportMessage::with_string_payload("m-poison", "OrderPlaced", "not json"),
        )
        .unwrap();

    assert!(transport.wait_for_len("errors", 1, WAIT));
    let dead = &transport.messages("errors")[0];
    assert_eq!(dead.id(), "m-poison");
    assert_eq!(dead.header(headers::FAILURE_KIND), Some("DeserializationFailed"));
    assert_eq!(dead.header(headers::RETRY_COUNT), Some("0"));
    assert_eq!(dead.header(headers::SOURCE_QUEUE), Some("billing"));
    assert_eq!(dead.payload_str(), Some("not json"));
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[test]
fn oversized_payload_is_rejected_before_sending() {
    let transport = InMemoryTransport::new();
    let bus = Bus::builder(settings("orders").with_max_message_size(16), transport.clone())
        .build()
        .unwrap();

    let err = bus
        .send(order("an-order-id-that-does-not-fit"))
        .unwrap_err();

    assert!(matches!(err, BusError::PayloadTooLarge { max: 16, .. }));
    assert!(transport.is_empty("orders"));
}

#[test]
fn reserved_header_is_rejected() {
    let transport = InMemoryTransport::new();
    let bus = Bus::builder(settings("orders"), transport.clone())
        .build()
        .unwrap();

    let err = bus
        .send(Envelope::new(order("o-1")).with_header(headers::MESSAGE_ID, "forged"))
        .unwrap_err();

    assert!(matches!(err, BusError::HeaderCollision(ref name) if name == headers::MESSAGE_ID));
    assert!(transport.is_empty("orders"));
}

#[test]
fn send_only_bus_recovers_from_lost_connection() {
    let transport = InMemoryTransport::new();
    let bus = Bus::builder(
        settings("web").with_reconnect_backoff(Duration::from_millis(5), Duration::from_millis(20)),
        transport.clone(),
    )
    .build()
    .unwrap();

    transport.disconnect();
    bus.send_to("billing", order("o-1")).unwrap();
    bus.send_to("billing", order("o-2")).unwrap();

    assert!(transport.is_connected());
    assert_eq!(transport.len("billing"), 2);
}
