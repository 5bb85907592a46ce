pub mod client;
pub mod models;

pub use client::{CircuitState, GatewayError, GatewaySettings, HttpGatewayClient};
