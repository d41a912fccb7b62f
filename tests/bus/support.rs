//! Shared settings, message types and polling helpers.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sourced_bus::{Message, TransportSettings};
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(2);

/// Route bus logs to the test harness. Set `RUST_LOG=sourced_bus=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Settings with short poll and retry delays so tests run fast.
pub fn settings(queue: &str) -> TransportSettings {
    init_tracing();
    TransportSettings::new(queue)
        .with_poll_interval(Duration::from_millis(10))
        .with_retry_delay(Duration::from_millis(10))
        .with_shutdown_grace(Duration::from_millis(500))
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
pub struct OrderPlaced {
    pub order_id: String,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
pub struct PaymentReceived {
    pub order_id: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
pub struct OrderShipped {
    pub order_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
pub struct OrderCompleted {
    pub order_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
pub struct GetQuote {
    pub sku: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
#[message(name = "pricing.Quote")]
pub struct Quote {
    pub sku: String,
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
pub struct PriceQuote {
    pub supplier: String,
    pub price: u64,
}

pub fn order(order_id: &str) -> OrderPlaced {
    OrderPlaced {
        order_id: order_id.to_string(),
        total: 100,
    }
}
