//! Operational HTTP surface shared by both services.

pub mod health;

pub use health::{health_router, HealthState};
