//! Services module for matching-service.

pub mod events;
pub mod fx;
pub mod metrics;
pub mod store;

pub use events::{CapturingEventPublisher, EventPublisher, LogEventPublisher};
pub use fx::{FixedFxRates, FxRateSource, HttpFxRateProvider};
pub use metrics::{get_metrics, init_metrics};
pub use store::{Database, InMemoryStore, MatchStore};
