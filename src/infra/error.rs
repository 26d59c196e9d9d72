//! Startup and process-level failures.

use std::net::SocketAddr;

use sqlx::migrate::MigrateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("failed to connect to the blog store")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("failed to apply blog store migrations")]
    Migration(#[source] MigrateError),
    #[error("failed to bind http listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("http server stopped unexpectedly")]
    Serve(#[source] std::io::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl InfraError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    /// Whether the failure is a dependency being unreachable rather than a defect.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::DatabaseConnect(_) | Self::Bind { .. })
    }
}
