//! Event types and the observer registry shared by the monitor and the scheduler.
//!
//! Publishers own a [`ListenerRegistry`] per event family. Listeners are
//! registered per event kind and notified in registration order; a failing,
//! panicking or slow listener is isolated from the publisher and from the
//! listeners after it.

mod registry;
mod types;

pub use registry::{DeliveryReport, Listener, ListenerRegistry, Subscription, SubscriptionId};
pub use types::{
    Event, MetricSample, MonitorEvent, MonitorEventKind, SchedulerEvent, SchedulerEventKind,
};
