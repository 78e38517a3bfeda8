//! Observability: process logging, the event hub, counters and the push channel

pub mod events;
pub mod logging;
pub mod push;
pub mod stats;

pub use events::{EventHub, EventRecord, Observer, ObserverId};
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use push::PushServer;
pub use stats::{format_uptime, Stats, StatsAggregator};

pub use logging::{mqtt_span, trapper_span};
