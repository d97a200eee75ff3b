pub mod evaluations;
pub mod health;
pub mod reviews;

pub use evaluations::{list_decisions, request_evaluation};
pub use health::{health_check, metrics_handler, readiness_check};
pub use reviews::{confirm_suggestion, dismiss_suggestion, manual_match, unlink};
