//! Collaborator traits the simulation depends on. Adapters implement these;
//! the domain only ever sees the traits.

pub mod config_port;
pub mod price_port;
pub mod calendar_port;
pub mod holdings_port;
pub mod result_port;
