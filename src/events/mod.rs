//! Event Bus Module
//!
//! Broadcast and key-scoped publish/subscribe channels used to publish
//! connection-lifecycle and data-arrival events.

pub mod bus;
pub mod signal;
pub mod targeted;

pub use bus::{DataArrived, EventBus};
pub use signal::{Signal, Slot, SubscriptionId};
pub use targeted::TargetedSignal;
