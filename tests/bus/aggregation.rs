//! Scatter-gather through the bus, including the timeout reaper.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sourced_bus::aggregator::{
    Aggregator, AggregatorPersistor, AggregatorSession, InMemoryAggregatorPersistor,
};
use sourced_bus::transport::InMemoryTransport;
use sourced_bus::{Bus, Context, Envelope, HandlerError};

use crate::support::{settings, wait_until, PriceQuote, WAIT};

#[derive(Clone, Default)]
struct QuoteCollector {
    expected: usize,
    completed: Arc<Mutex<Vec<Vec<PriceQuote>>>>,
    timed_out: Arc<Mutex<Vec<AggregatorSession<PriceQuote>>>>,
}

impl Aggregator<PriceQuote> for QuoteCollector {
    fn is_complete(&self, session: &AggregatorSession<PriceQuote>) -> bool {
        session.len() >= self.expected
    }

    fn complete(&self, quotes: Vec<PriceQuote>, _: &Context<'_>) -> Result<(), HandlerError> {
        self.completed.lock().unwrap().push(quotes);
        Ok(())
    }

    fn timed_out(&self, session: AggregatorSession<PriceQuote>) {
        self.timed_out.lock().unwrap().push(session);
    }
}

fn quote(supplier: &str, price: u64) -> Envelope<PriceQuote> {
    Envelope::new(PriceQuote {
        supplier: supplier.to_string(),
        price,
    })
    .with_correlation_id("rfq-1")
}

#[test]
fn completes_once_with_every_part_in_arrival_order() {
    let transport = InMemoryTransport::new();
    let persistor = InMemoryAggregatorPersistor::new();
    let collector = QuoteCollector {
        expected: 3,
        ..QuoteCollector::default()
    };

    let bus = Bus::builder(settings("purchasing"), transport.clone())
        .aggregator::<PriceQuote, _, _>(collector.clone(), persistor.clone())
        .build()
        .unwrap();
    bus.start_consuming().unwrap();

    bus.send(quote("acme", 30)).unwrap();
    bus.send(quote("globex", 20)).unwrap();
    assert!(wait_until(WAIT, || {
        persistor
            .get::<PriceQuote>("PriceQuote", "rfq-1")
            .ok()
            .flatten()
            .is_some_and(|session| session.len() == 2)
    }));
    assert!(collector.completed.lock().unwrap().is_empty());

    bus.send(quote("initech", 25)).unwrap();
    assert!(wait_until(WAIT, || collector.completed.lock().unwrap().len() == 1));

    let completed = collector.completed.lock().unwrap().clone();
    let suppliers: Vec<&str> = completed[0].iter().map(|q| q.supplier.as_str()).collect();
    assert_eq!(suppliers, vec!["acme", "globex", "initech"]);
    assert!(persistor
        .get::<PriceQuote>("PriceQuote", "rfq-1")
        .unwrap()
        .is_none());
    assert!(transport.is_empty("errors"));
}

#[test]
fn sessions_from_different_requests_stay_apart() {
    let transport = InMemoryTransport::new();
    let persistor = InMemoryAggregatorPersistor::new();
    let collector = QuoteCollector {
        expected: 2,
        ..QuoteCollector::default()
    };

    let bus = Bus::builder(settings("purchasing"), transport.clone())
        .aggregator::<PriceQuote, _, _>(collector.clone(), persistor.clone())
        .build()
        .unwrap();
    bus.start_consuming().unwrap();

    bus.send(quote("acme", 30)).unwrap();
    bus.send(
        Envelope::new(PriceQuote {
            supplier: "globex".into(),
            price: 20,
        })
        .with_correlation_id("rfq-2"),
    )
    .unwrap();
    assert!(wait_until(WAIT, || persistor.len() == 2));
    assert!(collector.completed.lock().unwrap().is_empty());

    bus.send(quote("initech", 25)).unwrap();
    assert!(wait_until(WAIT, || collector.completed.lock().unwrap().len() == 1));
    assert_eq!(persistor.len(), 1);
}

#[test]
fn incomplete_session_is_reaped_after_timeout() {
    let transport = InMemoryTransport::new();
    let persistor = InMemoryAggregatorPersistor::new();
    let collector = QuoteCollector {
        expected: 3,
        ..QuoteCollector::default()
    };

    let bus = Bus::builder(
        settings("purchasing")
            .with_aggregator_timeout(Duration::from_millis(50), Duration::from_millis(10)),
        transport.clone(),
    )
    .aggregator::<PriceQuote, _, _>(collector.clone(), persistor.clone())
    .build()
    .unwrap();
    bus.start_consuming().unwrap();

    bus.send(quote("acme", 30)).unwrap();

    assert!(wait_until(WAIT, || collector.timed_out.lock().unwrap().len() == 1));
    let reaped = collector.timed_out.lock().unwrap()[0].clone();
    assert_eq!(reaped.correlation_id, "rfq-1");
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped.messages[0].supplier, "acme");
    assert!(persistor.is_empty());
    assert!(collector.completed.lock().unwrap().is_empty());
}
