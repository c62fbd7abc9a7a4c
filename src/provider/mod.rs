//! Provider boundary
//!
//! The only place the market data provider's protocol is touched. A
//! [`ProviderConnector`] opens sessions under a numeric client identity; a
//! [`ProviderSession`] serves historical requests one at a time. Connections
//! own exactly one session each and never share it across tasks.

use crate::{Bar, Granularity, TimeRange};
use async_trait::async_trait;

pub mod replay;

pub use replay::ReplayProvider;

/// Error reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", render(.code, .message))]
pub struct ProviderError {
    /// Provider error code, when it sent one
    pub code: Option<i32>,
    /// Provider message
    pub message: String,
    /// The session is gone and must not be reused
    pub disconnected: bool,
}

fn render(code: &Option<i32>, message: &str) -> String {
    match code {
        Some(code) => format!("provider error {code}: {message}"),
        None => format!("provider error: {message}"),
    }
}

impl ProviderError {
    /// Error carrying a provider code
    pub fn coded(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            disconnected: false,
        }
    }

    /// Error without a code (transport failures, local faults)
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            disconnected: false,
        }
    }

    /// Mark the session as lost
    pub fn disconnected(mut self) -> Self {
        self.disconnected = true;
        self
    }
}

/// Opens provider sessions
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    /// Perform the handshake for `identity` against `endpoint`
    async fn connect(
        &self,
        identity: i32,
        endpoint: &str,
    ) -> Result<Box<dyn ProviderSession>, ProviderError>;
}

/// One live provider session
#[async_trait]
pub trait ProviderSession: Send {
    /// Bars with open time inside `range`, oldest first
    async fn fetch_historical(
        &mut self,
        symbol: &str,
        granularity: Granularity,
        range: TimeRange,
    ) -> Result<Vec<Bar>, ProviderError>;

    /// Earliest timestamp the provider holds for a symbol
    async fn head_timestamp(&mut self, _symbol: &str) -> Result<Option<i64>, ProviderError> {
        Ok(None)
    }

    /// Close the session
    async fn disconnect(&mut self);
}
