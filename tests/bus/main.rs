//! Bus integration tests over the in-memory transport.

mod support;
mod messaging;
mod retries;
mod sagas;
mod aggregation;
mod lifecycle;
