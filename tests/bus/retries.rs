//! Redelivery with a delay, dead-lettering and the error callback.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sourced_bus::transport::InMemoryTransport;
use sourced_bus::{
    headers, Bus, Context, Envelope, ErrorReport, FailureKind, HandlerError, TransportMessage,
};

use crate::support::{order, settings, wait_until, OrderPlaced, WAIT};

#[test]
fn failing_handler_is_retried_then_dead_lettered() {
    let transport = InMemoryTransport::new();
    let attempts = Arc::new(Mutex::new(Vec::<(u32, Instant)>::new()));
    let reports = Arc::new(Mutex::new(Vec::<ErrorReport>::new()));
    let attempt_log = Arc::clone(&attempts);
    let report_log = Arc::clone(&reports);

    let billing = Bus::builder(
        settings("billing")
            .with_max_retries(3)
            .with_retry_delay(Duration::from_millis(100)),
        transport.clone(),
    )
    .handle_fn(move |_: OrderPlaced, ctx: &Context| -> Result<(), HandlerError> {
        attempt_log
            .lock()
            .unwrap()
            .push((ctx.retry_count(), Instant::now()));
        Err(HandlerError::Rejected("card declined".into()))
    })
    .on_error(move |report: &ErrorReport| report_log.lock().unwrap().push(report.clone()))
    .build()
    .unwrap();
    billing.start_consuming().unwrap();

    let envelope = Envelope::new(order("o-1"));
    let id = envelope.id().to_string();
    billing.send_to("billing", envelope).unwrap();

    assert!(transport.wait_for_len("errors", 1, Duration::from_secs(5)));
    assert!(wait_until(WAIT, || reports.lock().unwrap().len() == 1));

    let attempts = attempts.lock().unwrap().clone();
    let counts: Vec<u32> = attempts.iter().map(|(count, _)| *count).collect();
    assert_eq!(counts, vec![0, 1, 2, 3]);
    let elapsed = attempts[3].1.duration_since(attempts[0].1);
    assert!(elapsed >= Duration::from_millis(300), "retries came back after {:?}", elapsed);

    let dead = &transport.messages("errors")[0];
    assert_eq!(dead.id(), id);
    assert_eq!(dead.header(headers::FAILURE_KIND), Some("HandlerFailed"));
    assert_eq!(dead.header(headers::RETRY_COUNT), Some("3"));
    assert!(dead
        .header(headers::FAILURE_REASON)
        .is_some_and(|reason| reason.contains("card declined")));

    let report = reports.lock().unwrap()[0].clone();
    assert_eq!(report.message_id, id);
    assert_eq!(report.message_type, "OrderPlaced");
    assert_eq!(report.queue, "billing");
    assert_eq!(report.kind, FailureKind::HandlerFailed);
    assert_eq!(report.retry_count, 3);

    let stats = billing.stop_consuming();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.retried, 3);
}

#[test]
fn transient_failure_recovers_on_redelivery() {
    let transport = InMemoryTransport::new();
    let handled_at = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&handled_at);

    let billing = Bus::builder(settings("billing"), transport.clone())
        .handle_fn(move |_: OrderPlaced, ctx: &Context| -> Result<(), HandlerError> {
            if ctx.retry_count() < 2 {
                return Err(HandlerError::Rejected("gateway unavailable".into()));
            }
            *sink.lock().unwrap() = Some(ctx.retry_count());
            Ok(())
        })
        .build()
        .unwrap();
    billing.start_consuming().unwrap();

    billing.send_to("billing", order("o-1")).unwrap();

    assert!(wait_until(WAIT, || handled_at.lock().unwrap().is_some()));
    assert_eq!(*handled_at.lock().unwrap(), Some(2));
    assert!(transport.is_empty("errors"));
}

#[test]
fn zero_retries_dead_letters_on_first_failure() {
    let transport = InMemoryTransport::new();
    let billing = Bus::builder(settings("billing").with_max_retries(0), transport.clone())
        .handle_fn(|_: OrderPlaced, _: &Context| -> Result<(), HandlerError> {
            Err(HandlerError::Rejected("nope".into()))
        })
        .build()
        .unwrap();
    billing.start_consuming().unwrap();

    billing.send_to("billing", order("o-1")).unwrap();

    assert!(transport.wait_for_len("errors", 1, WAIT));
    assert_eq!(
        transport.messages("errors")[0].header(headers::RETRY_COUNT),
        Some("0")
    );
}

#[test]
fn message_without_handlers_is_dead_lettered() {
    let transport = InMemoryTransport::new();
    let billing = Bus::builder(settings("billing"), transport.clone())
        .handle_fn(|_: OrderPlaced, _: &Context| -> Result<(), HandlerError> { Ok(()) })
        .build()
        .unwrap();
    billing.start_consuming().unwrap();

    billing
        .send_bytes(
            "billing",
            TransportMessage::with_string_payload("m-1", "RefundIssued", "{}"),
        )
        .unwrap();

    assert!(transport.wait_for_len("errors", 1, WAIT));
    let dead = &transport.messages("errors")[0];
    assert_eq!(dead.header(headers::FAILURE_KIND), Some("NoHandlers"));
    assert_eq!(dead.header(headers::RETRY_COUNT), Some("0"));
}

#[test]
fn no_ack_mode_never_retries() {
    let transport = InMemoryTransport::new();
    let attempts = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&attempts);

    let billing = Bus::builder(settings("billing").with_no_ack(true), transport.clone())
        .handle_fn(move |_: OrderPlaced, _: &Context| -> Result<(), HandlerError> {
            *counter.lock().unwrap() += 1;
            Err(HandlerError::Rejected("nope".into()))
        })
        .build()
        .unwrap();
    billing.start_consuming().unwrap();

    billing.send_to("billing", order("o-1")).unwrap();

    assert!(transport.wait_for_len("errors", 1, WAIT));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*attempts.lock().unwrap(), 1);
    assert_eq!(transport.unacked_count("billing"), 0);
}
