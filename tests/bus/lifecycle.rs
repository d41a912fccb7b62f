//! Start, stop, dispose and configuration of a bus.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sourced_bus::bus::{HandlerResolver, MessageHandler};
use sourced_bus::transport::InMemoryTransport;
use sourced_bus::{
    headers, Bus, BusError, Context, HandlerError, Message, TransportSettings, HEARTBEAT_TYPE,
};

use crate::support::{order, settings, wait_until, OrderPlaced, WAIT};

fn counting_bus(
    transport: &InMemoryTransport,
    settings: TransportSettings,
    handled: &Arc<AtomicUsize>,
) -> Bus<InMemoryTransport> {
    let handled = Arc::clone(handled);
    Bus::builder(settings, transport.clone())
        .handle_fn(move |_: OrderPlaced, _: &Context| -> Result<(), HandlerError> {
            handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap()
}

#[test]
fn dispose_is_idempotent_and_final() {
    let transport = InMemoryTransport::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let bus = counting_bus(&transport, settings("billing"), &handled);
    bus.start_consuming().unwrap();

    bus.dispose();
    bus.dispose();

    assert!(bus.is_disposed());
    assert!(!bus.is_consuming());
    assert!(matches!(bus.send(order("o-1")), Err(BusError::Disposed)));
    assert!(matches!(bus.publish(order("o-1")), Err(BusError::Disposed)));
    assert!(matches!(bus.start_consuming(), Err(BusError::Disposed)));
    assert!(!transport.is_connected());
}

#[test]
fn consuming_can_be_stopped_and_restarted() {
    let transport = InMemoryTransport::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let bus = counting_bus(&transport, settings("billing"), &handled);

    bus.start_consuming().unwrap();
    assert!(matches!(bus.start_consuming(), Err(BusError::Configuration(_))));
    bus.send(order("o-1")).unwrap();
    assert!(wait_until(WAIT, || handled.load(Ordering::SeqCst) == 1));

    let stats = bus.stop_consuming();
    assert_eq!(stats.handled, 1);
    assert!(!bus.is_consuming());

    bus.send(order("o-2")).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(transport.len("billing"), 1);

    bus.start_consuming().unwrap();
    assert!(wait_until(WAIT, || handled.load(Ordering::SeqCst) == 2));
    assert!(transport.is_empty("billing"));
}

#[test]
fn dispose_waits_for_in_flight_handlers() {
    let transport = InMemoryTransport::new();
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (start_flag, finish_flag) = (Arc::clone(&started), Arc::clone(&finished));

    let bus = Bus::builder(settings("billing"), transport.clone())
        .handle_fn(move |_: OrderPlaced, _: &Context| -> Result<(), HandlerError> {
            start_flag.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(150));
            finish_flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap();
    bus.start_consuming().unwrap();
    bus.send(order("o-1")).unwrap();

    assert!(wait_until(WAIT, || started.load(Ordering::SeqCst)));
    bus.dispose();

    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn invalid_settings_fail_the_build() {
    let transport = InMemoryTransport::new();

    let missing_queue = Bus::builder(TransportSettings::new(""), transport.clone()).build();
    assert!(matches!(missing_queue, Err(BusError::Configuration(_))));

    let error_queue_clash = Bus::builder(
        settings("billing").with_error_queue("billing"),
        transport.clone(),
    )
    .build();
    assert!(matches!(error_queue_clash, Err(BusError::Configuration(_))));

    let no_flows = Bus::builder(settings("billing").with_concurrency(0), transport.clone()).build();
    assert!(matches!(no_flows, Err(BusError::Configuration(_))));

    let no_sweep = Bus::builder(
        settings("billing").with_aggregator_timeout(Duration::from_secs(1), Duration::ZERO),
        transport.clone(),
    )
    .build();
    assert!(matches!(no_sweep, Err(BusError::Configuration(_))));
}

#[test]
fn purge_on_startup_drops_stale_messages() {
    let transport = InMemoryTransport::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let bus = counting_bus(
        &transport,
        settings("billing").with_purge_on_startup(true),
        &handled,
    );

    bus.send(order("stale-1")).unwrap();
    bus.send(order("stale-2")).unwrap();
    assert_eq!(transport.len("billing"), 2);

    bus.start_consuming().unwrap();
    assert!(transport.is_empty("billing"));

    bus.send(order("fresh")).unwrap();
    assert!(wait_until(WAIT, || handled.load(Ordering::SeqCst) == 1));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[test]
fn heartbeat_is_sent_when_consuming_starts() {
    let transport = InMemoryTransport::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let bus = counting_bus(
        &transport,
        settings("billing").with_heartbeat_queue("heartbeats"),
        &handled,
    );

    bus.start_consuming().unwrap();

    let beats = transport.messages("heartbeats");
    assert_eq!(beats.len(), 1);
    assert_eq!(beats[0].message_type(), HEARTBEAT_TYPE);
    assert!(beats[0].payload_str().is_some_and(|body| body.contains("billing")));
}

#[test]
fn consumed_queue_is_declared_and_subscribed() {
    let transport = InMemoryTransport::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let bus = counting_bus(&transport, settings("billing"), &handled);

    assert!(transport.queue_options("billing").is_none());
    bus.start_consuming().unwrap();

    assert!(transport.queue_options("billing").is_some());
    assert_eq!(bus.publish(order("o-1")).unwrap(), 1);
}

#[test]
fn concurrent_flows_handle_messages_in_parallel() {
    let transport = InMemoryTransport::new();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));
    let (current, max, done) = (Arc::clone(&in_flight), Arc::clone(&peak), Arc::clone(&handled));

    let bus = Bus::builder(settings("billing").with_concurrency(4), transport.clone())
        .handle_fn(move |_: OrderPlaced, _: &Context| -> Result<(), HandlerError> {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            current.fetch_sub(1, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap();
    bus.start_consuming().unwrap();

    for i in 0..8 {
        bus.send(order(&format!("o-{}", i))).unwrap();
    }

    assert!(wait_until(WAIT, || handled.load(Ordering::SeqCst) == 8));
    assert!(peak.load(Ordering::SeqCst) > 1);
    assert!(peak.load(Ordering::SeqCst) <= 4);
}

struct StaticResolver {
    handler: Arc<dyn MessageHandler>,
}

impl HandlerResolver for StaticResolver {
    fn resolve(&self, message_type: &str) -> Vec<Arc<dyn MessageHandler>> {
        if message_type == self.handler.message_type() {
            vec![Arc::clone(&self.handler)]
        } else {
            Vec::new()
        }
    }

    fn message_types(&self) -> Vec<String> {
        vec![self.handler.message_type().to_string()]
    }
}

struct CountingHandler(Arc<AtomicUsize>);

impl MessageHandler for CountingHandler {
    fn message_type(&self) -> &'static str {
        OrderPlaced::type_name()
    }

    fn handle(&self, ctx: &Context<'_>) -> Result<(), BusError> {
        let order: OrderPlaced = ctx.decode()?;
        assert_eq!(order.order_id, "o-1");
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn custom_resolver_supplies_the_handlers() {
    let transport = InMemoryTransport::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let bus = Bus::builder(settings("billing"), transport.clone())
        .resolver(StaticResolver {
            handler: Arc::new(CountingHandler(Arc::clone(&handled))),
        })
        .build()
        .unwrap();
    bus.start_consuming().unwrap();

    bus.send(order("o-1")).unwrap();

    assert!(wait_until(WAIT, || handled.load(Ordering::SeqCst) == 1));
}

#[test]
fn resolver_and_registered_handlers_do_not_mix() {
    let transport = InMemoryTransport::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let result = Bus::builder(settings("billing"), transport.clone())
        .handle_fn(|_: OrderPlaced, _: &Context| -> Result<(), HandlerError> { Ok(()) })
        .resolver(StaticResolver {
            handler: Arc::new(CountingHandler(handled)),
        })
        .build();

    assert!(matches!(result, Err(BusError::Configuration(_))));
}

#[cfg(feature = "bitcode")]
#[test]
fn bitcode_bus_round_trips_messages() {
    use sourced_bus::{BitcodeSerializer, BusBuilder};

    let transport = InMemoryTransport::new();
    let received = Arc::new(std::sync::Mutex::new(None));
    let sink = Arc::clone(&received);

    let bus = BusBuilder::with_serializer(settings("billing"), transport.clone(), BitcodeSerializer)
        .handle_fn(
            move |order: OrderPlaced, _: &Context<'_, BitcodeSerializer>| -> Result<(), HandlerError> {
                *sink.lock().unwrap() = Some(order);
                Ok(())
            },
        )
        .build()
        .unwrap();

    bus.send(order("o-1")).unwrap();
    let wire = &transport.messages("billing")[0];
    assert_ne!(wire.header(headers::CONTENT_TYPE), Some("application/json"));
    assert!(serde_json::from_slice::<OrderPlaced>(&wire.payload).is_err());

    bus.start_consuming().unwrap();
    assert!(wait_until(WAIT, || received.lock().unwrap().is_some()));
    assert_eq!(received.lock().unwrap().clone(), Some(order("o-1")));
}

#[test]
fn unbounded_shutdown_grace_disposes_cleanly() {
    let transport = InMemoryTransport::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let bus = counting_bus(
        &transport,
        settings("billing").with_shutdown_grace(Duration::MAX),
        &handled,
    );
    bus.start_consuming().unwrap();

    bus.send(order("o-1")).unwrap();
    assert!(wait_until(WAIT, || handled.load(Ordering::SeqCst) == 1));

    drop(bus);
    assert_eq!(transport.unacked_count("billing"), 0);
}
