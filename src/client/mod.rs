//! Client API: configuration and the [`TcpClient`] facade.

#[allow(clippy::module_inception)]
mod client;
mod config;
mod worker;

#[cfg(test)]
mod e2e;

pub use client::TcpClient;
pub use config::{ClientConfig, ClientConfigBuilder, EngineMode, Limits, RetryPolicy, Timeouts};
