//! Change broadcasting.
//!
//! - `delta`: the deltas published by the engine and the topic filters subscribers use
//! - `broadcaster`: bounded per-subscriber fan-out with backpressure closure

pub mod broadcaster;
pub mod delta;

pub use broadcaster::{BroadcastStats, Broadcaster, CloseReason, DeltaSink, Notification, Subscription};
pub use delta::{Delta, SubscriptionFilter, Topic};
