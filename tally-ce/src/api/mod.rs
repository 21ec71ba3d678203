//! HTTP trigger for the categorization engine
//!
//! External schedulers call these endpoints; every response carries enough
//! state (`needs_another_call`, `retry_after_ms`) for the caller to decide
//! whether to call again.

pub mod categorize;
pub mod health;

pub use categorize::categorize_routes;
pub use health::health_routes;
