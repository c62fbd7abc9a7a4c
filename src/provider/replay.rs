//! File-backed provider
//!
//! Serves bars from a directory laid out like a [`CsvStore`] cache, so a cache
//! directory captured on one machine can be replayed through the full loader
//! on another. Used by the CLI and in tests.

use super::{ProviderConnector, ProviderError, ProviderSession};
use crate::store::{CsvStore, LocalStore, StoreError};
use crate::{Bar, Granularity, TimeRange};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Provider reading from CSV files
#[derive(Debug, Clone)]
pub struct ReplayProvider {
    source: Arc<CsvStore>,
    busy_identities: HashSet<i32>,
}

impl ReplayProvider {
    /// Replay files under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: Arc::new(CsvStore::new(dir)),
            busy_identities: HashSet::new(),
        }
    }

    /// Identities that fail the handshake as already in use
    pub fn with_busy_identities(mut self, identities: impl IntoIterator<Item = i32>) -> Self {
        self.busy_identities.extend(identities);
        self
    }
}

#[async_trait]
impl ProviderConnector for ReplayProvider {
    async fn connect(
        &self,
        identity: i32,
        endpoint: &str,
    ) -> Result<Box<dyn ProviderSession>, ProviderError> {
        if self.busy_identities.contains(&identity) {
            return Err(ProviderError::coded(
                326,
                format!("Unable to connect as the client id is already in use: {identity}"),
            ));
        }
        if !self.source.root().is_dir() {
            return Err(ProviderError::message(format!(
                "replay directory {} does not exist",
                self.source.root().display()
            )));
        }
        debug!(identity, %endpoint, root = %self.source.root().display(), "Replay session opened");
        Ok(Box::new(ReplaySession {
            source: Arc::clone(&self.source),
        }))
    }
}

struct ReplaySession {
    source: Arc<CsvStore>,
}

impl ReplaySession {
    fn ensure_known(&self, symbol: &str, granularity: Granularity) -> Result<(), ProviderError> {
        let path = self.source.path_for(symbol, granularity).map_err(map_store)?;
        if path.exists() {
            Ok(())
        } else {
            Err(ProviderError::coded(
                200,
                format!("No security definition has been found for the request: {symbol} {granularity}"),
            ))
        }
    }
}

fn map_store(err: StoreError) -> ProviderError {
    match err {
        StoreError::InvalidSymbol(symbol) => ProviderError::coded(
            200,
            format!("No security definition has been found for the request: {symbol:?}"),
        ),
        other => ProviderError::message(other.to_string()),
    }
}

#[async_trait]
impl ProviderSession for ReplaySession {
    async fn fetch_historical(
        &mut self,
        symbol: &str,
        granularity: Granularity,
        range: TimeRange,
    ) -> Result<Vec<Bar>, ProviderError> {
        self.ensure_known(symbol, granularity)?;
        self.source
            .read(symbol, granularity, range)
            .await
            .map_err(map_store)
    }

    async fn head_timestamp(&mut self, symbol: &str) -> Result<Option<i64>, ProviderError> {
        let mut earliest: Option<i64> = None;
        for granularity in Granularity::ALL {
            if let Some(bounds) = self
                .source
                .bounds(symbol, granularity)
                .await
                .map_err(map_store)?
            {
                earliest = Some(earliest.map_or(bounds.start(), |e| e.min(bounds.start())));
            }
        }
        Ok(earliest)
    }

    async fn disconnect(&mut self) {}
}
