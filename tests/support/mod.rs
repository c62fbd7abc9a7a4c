//! Shared fixtures: a scripted in-memory provider and bar builders

#![allow(dead_code)]

use async_trait::async_trait;
use market_data_loader::clock::ManualClock;
use market_data_loader::config::LoaderConfig;
use market_data_loader::downloader::FetchOrchestrator;
use market_data_loader::provider::{ProviderConnector, ProviderError, ProviderSession};
use market_data_loader::store::LocalStore;
use market_data_loader::{Bar, Granularity, TimeRange};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const MINUTE: i64 = 60_000;
pub const HOUR: i64 = 3_600_000;
pub const DAY: i64 = 86_400_000;

/// Monday 2024-03-04 00:00 UTC
pub const MONDAY: i64 = 1_709_510_400_000;

/// A valid bar with prices derived from its timestamp
pub fn bar(timestamp: i64) -> Bar {
    let base = Decimal::from(100 + (timestamp / MINUTE) % 50);
    Bar {
        timestamp,
        open: base,
        high: base + Decimal::from(2),
        low: base - Decimal::from(2),
        close: base + Decimal::ONE,
        volume: Decimal::from(1_000),
    }
}

/// Bars every `granularity` across `range`
pub fn bars_in(range: TimeRange, granularity: Granularity) -> Vec<Bar> {
    let step = granularity.to_milliseconds();
    (range.start()..range.end())
        .step_by(step as usize)
        .map(bar)
        .collect()
}

/// Bars on weekdays only (Mon-Fri), every `granularity`, across `range`
pub fn weekday_bars_in(range: TimeRange, granularity: Granularity) -> Vec<Bar> {
    bars_in(range, granularity)
        .into_iter()
        .filter(|b| {
            // 1970-01-01 was a Thursday.
            let weekday = (b.timestamp.div_euclid(DAY) + 3) % 7;
            weekday < 5
        })
        .collect()
}

pub fn range(start: i64, end: i64) -> TimeRange {
    TimeRange::new(start, end).unwrap()
}

/// Defaults, except that new connections skip the health-check delay and
/// `BTCUSD` trades around the clock
pub fn test_config() -> LoaderConfig {
    let mut config = LoaderConfig::default();
    config.connection.health_check_delay_ms = 0;
    config.calendar.continuous_symbols = vec!["BTCUSD".to_string()];
    config
}

/// Orchestrator over `provider` and `store` with "now" frozen at `now`
pub fn orchestrator(
    config: &LoaderConfig,
    provider: &ScriptedProvider,
    store: Arc<dyn LocalStore>,
    now: i64,
) -> FetchOrchestrator {
    FetchOrchestrator::from_config(config, Arc::new(provider.clone()), store)
        .unwrap()
        .with_clock(Arc::new(ManualClock::new(now)))
}

/// Assert consecutive calls are at least `gap` apart
pub fn assert_spacing(calls: &[Call], gap: Duration) {
    for pair in calls.windows(2) {
        let spacing = pair[1].at.duration_since(pair[0].at);
        assert!(
            spacing >= gap,
            "calls {} and {} only {:?} apart",
            pair[0].range,
            pair[1].range,
            spacing
        );
    }
}

/// One historical call seen by the provider
#[derive(Debug, Clone)]
pub struct Call {
    pub identity: i32,
    pub symbol: String,
    pub range: TimeRange,
    pub at: Instant,
}

struct FailureRule {
    matches: Box<dyn Fn(&TimeRange) -> bool + Send + Sync>,
    remaining: Option<usize>,
    error: ProviderError,
}

#[derive(Default)]
struct State {
    series: HashMap<String, Vec<Bar>>,
    rules: Vec<FailureRule>,
    busy: HashSet<i32>,
    head: Option<i64>,
    latency: Duration,
    calls: Vec<Call>,
    connects: Vec<i32>,
    disconnects: usize,
}

/// In-memory provider whose data, failures and busy identities are scripted by the test
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<State>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `bars` for `symbol`
    pub fn with_series(self, symbol: &str, bars: Vec<Bar>) -> Self {
        self.state().series.insert(symbol.to_string(), bars);
        self
    }

    /// Identities that fail the handshake with "client id is already in use"
    pub fn with_busy_identities(self, identities: impl IntoIterator<Item = i32>) -> Self {
        self.state().busy.extend(identities);
        self
    }

    /// Answer head-timestamp lookups with `head`
    pub fn with_head_timestamp(self, head: i64) -> Self {
        self.state().head = Some(head);
        self
    }

    /// Delay every historical response
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = latency;
        self
    }

    /// Fail every request whose range satisfies `matches`
    pub fn fail_when(
        self,
        matches: impl Fn(&TimeRange) -> bool + Send + Sync + 'static,
        error: ProviderError,
    ) -> Self {
        self.push_rule(Box::new(matches), None, error)
    }

    /// Fail the first `times` requests whose range satisfies `matches`
    pub fn fail_times(
        self,
        matches: impl Fn(&TimeRange) -> bool + Send + Sync + 'static,
        times: usize,
        error: ProviderError,
    ) -> Self {
        self.push_rule(Box::new(matches), Some(times), error)
    }

    fn push_rule(
        self,
        matches: Box<dyn Fn(&TimeRange) -> bool + Send + Sync>,
        remaining: Option<usize>,
        error: ProviderError,
    ) -> Self {
        self.state().rules.push(FailureRule {
            matches,
            remaining,
            error,
        });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn connects(&self) -> Vec<i32> {
        self.state().connects.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl ProviderConnector for ScriptedProvider {
    async fn connect(
        &self,
        identity: i32,
        _endpoint: &str,
    ) -> Result<Box<dyn ProviderSession>, ProviderError> {
        let mut state = self.state();
        state.connects.push(identity);
        if state.busy.contains(&identity) {
            return Err(ProviderError::coded(
                326,
                format!("Unable to connect as the client id is already in use: {identity}"),
            ));
        }
        Ok(Box::new(ScriptedSession {
            identity,
            provider: self.clone(),
        }))
    }
}

struct ScriptedSession {
    identity: i32,
    provider: ScriptedProvider,
}

#[async_trait]
impl ProviderSession for ScriptedSession {
    async fn fetch_historical(
        &mut self,
        symbol: &str,
        _granularity: Granularity,
        range: TimeRange,
    ) -> Result<Vec<Bar>, ProviderError> {
        let latency = {
            let mut state = self.provider.state();
            state.calls.push(Call {
                identity: self.identity,
                symbol: symbol.to_string(),
                range,
                at: Instant::now(),
            });

            for rule in state.rules.iter_mut() {
                if !(rule.matches)(&range) {
                    continue;
                }
                match rule.remaining.as_mut() {
                    Some(0) => continue,
                    Some(remaining) => *remaining -= 1,
                    None => {}
                }
                return Err(rule.error.clone());
            }
            state.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let state = self.provider.state();
        Ok(state
            .series
            .get(symbol)
            .map(|bars| {
                bars.iter()
                    .filter(|b| range.contains(b.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn head_timestamp(&mut self, _symbol: &str) -> Result<Option<i64>, ProviderError> {
        Ok(self.provider.state().head)
    }

    async fn disconnect(&mut self) {
        self.provider.state().disconnects += 1;
    }
}
