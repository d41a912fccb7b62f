//! Process managers driven through the bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sourced_bus::process_manager::{
    InMemoryProcessManagerStore, ProcessManager, ProcessManagerData, Transition,
};
use sourced_bus::transport::InMemoryTransport;
use sourced_bus::{headers, Bus, Context, Envelope, HandlerError};

use crate::support::{
    order, settings, wait_until, OrderCompleted, OrderPlaced, OrderShipped, PaymentReceived, WAIT,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Fulfillment {
    order_id: String,
    paid: u64,
    shipped: bool,
}

impl ProcessManagerData for Fulfillment {
    const COLLECTION: &'static str = "fulfillments";
}

impl Fulfillment {
    fn transition(&self, ctx: &Context<'_>) -> Result<Transition, HandlerError> {
        if self.paid > 0 && self.shipped {
            ctx.send(OrderCompleted {
                order_id: self.order_id.clone(),
            })?;
            return Ok(Transition::Complete);
        }
        Ok(Transition::Continue)
    }
}

#[derive(Default)]
struct FulfillmentSaga {
    payments_applied: AtomicUsize,
}

impl ProcessManager<OrderPlaced> for FulfillmentSaga {
    type Data = Fulfillment;

    fn correlation_key(&self, message: &OrderPlaced, _: &Context<'_>) -> String {
        message.order_id.clone()
    }

    fn is_starter(&self) -> bool {
        true
    }

    fn new_data(&self, key: &str, _: &OrderPlaced) -> Result<Fulfillment, HandlerError> {
        Ok(Fulfillment {
            order_id: key.to_string(),
            ..Fulfillment::default()
        })
    }

    fn handle(
        &self,
        data: &mut Fulfillment,
        _: &OrderPlaced,
        ctx: &Context<'_>,
    ) -> Result<Transition, HandlerError> {
        data.transition(ctx)
    }
}

impl ProcessManager<PaymentReceived> for FulfillmentSaga {
    type Data = Fulfillment;

    fn correlation_key(&self, message: &PaymentReceived, _: &Context<'_>) -> String {
        message.order_id.clone()
    }

    fn handle(
        &self,
        data: &mut Fulfillment,
        message: &PaymentReceived,
        ctx: &Context<'_>,
    ) -> Result<Transition, HandlerError> {
        self.payments_applied.fetch_add(1, Ordering::SeqCst);
        data.paid += message.amount;
        data.transition(ctx)
    }
}

impl ProcessManager<OrderShipped> for FulfillmentSaga {
    type Data = Fulfillment;

    fn correlation_key(&self, message: &OrderShipped, _: &Context<'_>) -> String {
        message.order_id.clone()
    }

    fn handle(
        &self,
        data: &mut Fulfillment,
        _: &OrderShipped,
        ctx: &Context<'_>,
    ) -> Result<Transition, HandlerError> {
        data.shipped = true;
        data.transition(ctx)
    }
}

fn fulfillment_bus(
    transport: &InMemoryTransport,
    store: &InMemoryProcessManagerStore,
    saga: &Arc<FulfillmentSaga>,
) -> Bus<InMemoryTransport> {
    let builder = Bus::builder(settings("fulfillment"), transport.clone())
        .map::<OrderCompleted>("notifications");
    let runtime = builder.process_manager_runtime(store.clone());
    let bus = builder
        .process_manager::<OrderPlaced, _, _, _>(Arc::clone(saga), Arc::clone(&runtime))
        .process_manager::<PaymentReceived, _, _, _>(Arc::clone(saga), Arc::clone(&runtime))
        .process_manager::<OrderShipped, _, _, _>(Arc::clone(saga), runtime)
        .build()
        .unwrap();
    bus.start_consuming().unwrap();
    bus
}

fn payment(order_id: &str) -> PaymentReceived {
    PaymentReceived {
        order_id: order_id.to_string(),
        amount: 100,
    }
}

#[test]
fn saga_runs_from_start_to_completion() {
    let transport = InMemoryTransport::new();
    let store = InMemoryProcessManagerStore::new();
    let saga = Arc::new(FulfillmentSaga::default());
    let bus = fulfillment_bus(&transport, &store, &saga);

    bus.send(order("o-1")).unwrap();
    assert!(wait_until(WAIT, || store.version("fulfillments", "o-1") == Some(1)));

    bus.send(payment("o-1")).unwrap();
    assert!(wait_until(WAIT, || store.version("fulfillments", "o-1") == Some(2)));
    assert!(transport.is_empty("notifications"));

    bus.send(OrderShipped {
        order_id: "o-1".into(),
    })
    .unwrap();
    assert!(transport.wait_for_len("notifications", 1, WAIT));

    assert!(!store.contains("fulfillments", "o-1"));
    let completed = &transport.messages("notifications")[0];
    assert_eq!(completed.message_type(), "OrderCompleted");
    assert!(transport.is_empty("errors"));
}

#[test]
fn message_for_unknown_instance_is_a_consistency_violation() {
    let transport = InMemoryTransport::new();
    let store = InMemoryProcessManagerStore::new();
    let saga = Arc::new(FulfillmentSaga::default());
    let bus = fulfillment_bus(&transport, &store, &saga);

    bus.send(payment("o-404")).unwrap();

    assert!(transport.wait_for_len("errors", 1, WAIT));
    let dead = &transport.messages("errors")[0];
    assert_eq!(dead.header(headers::FAILURE_KIND), Some("ConsistencyViolation"));
    assert_eq!(dead.header(headers::RETRY_COUNT), Some("0"));
    assert!(store.is_empty());
    assert_eq!(saga.payments_applied.load(Ordering::SeqCst), 0);
}

#[test]
fn redelivered_message_is_applied_once() {
    let transport = InMemoryTransport::new();
    let store = InMemoryProcessManagerStore::new();
    let saga = Arc::new(FulfillmentSaga::default());
    let bus = fulfillment_bus(&transport, &store, &saga);

    bus.send(order("o-1")).unwrap();
    assert!(wait_until(WAIT, || store.contains("fulfillments", "o-1")));

    for _ in 0..2 {
        bus.send(Envelope::new(payment("o-1")).with_id("pay-1")).unwrap();
    }
    assert!(wait_until(WAIT, || {
        transport
            .acknowledged()
            .iter()
            .filter(|id| id.as_str() == "pay-1")
            .count()
            == 2
    }));

    assert_eq!(saga.payments_applied.load(Ordering::SeqCst), 1);
    assert_eq!(store.version("fulfillments", "o-1"), Some(2));
    assert!(transport.is_empty("errors"));
}
