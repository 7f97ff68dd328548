//! Listener fan-out

pub mod registry;

pub use registry::{Broadcaster, DeliveryReport, ListenerId, ListenerRegistry, ListenerStream};
