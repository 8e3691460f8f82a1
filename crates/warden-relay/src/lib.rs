//! Relay transport.
//!
//! One `Relay` handle per relay URL. The connection itself lives in a
//! background task that owns the subscription and publish registries,
//! reconnects with a fixed pause forever, and re-issues every
//! registered subscription (with its latest cursor) each time the
//! socket opens. Consumers therefore observe at-least-once delivery
//! across reconnects.

pub mod batcher;
pub mod conn;
pub mod error;
pub mod frame;

pub use batcher::SubscriptionBatcher;
pub use conn::{ConnState, Relay, SubMode, SubUpdate};
pub use error::{RelayError, RelayResult};
pub use frame::Filter;
