//! Admission Control
//!
//! Guards the server against a single source address opening too many
//! connections or hammering the login path.
//!
//! - **RateGovernor**: per-address connection counts and a sliding one-minute
//!   window of authentication attempts
//! - **client_address**: resolves the address a request is accounted under

mod address;
mod limiter;

pub use address::{client_address, UNKNOWN_ADDRESS};
pub use limiter::{AdmissionGuard, GovernorConfig, RateGovernor};
