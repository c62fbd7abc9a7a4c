//! The fetch orchestrator

use super::{
    LoadDiagnostics, LoadError, LoadFailure, LoadMode, LoadOutcome, LoadRequest, RetryDecision,
    RetryPolicy, SkippedSegment,
};
use crate::cancel::CancelHandle;
use crate::classifier::{ErrorClassification, ErrorKind};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ConfigResult, LoaderConfig};
use crate::connection::{ConnectionError, ConnectionManager, Request, RequestError, Response};
use crate::metrics;
use crate::pacing::{PacingGovernor, RequestCategory};
use crate::planner::{default_max_history, GapAnalyzer, PlanDirection, Segment, SegmentPlanner};
use crate::provider::ProviderConnector;
use crate::store::{KeyedLocks, LocalStore, SeriesKey};
use crate::{normalize_symbol, Bar, Granularity, TimeRange};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

enum SegmentResult {
    Fetched(Vec<Bar>),
    Skipped(SkippedSegment),
    Cancelled,
    Failed(LoadError),
}

enum AttemptError {
    Connection(ConnectionError),
    Request(RequestError),
    PacingTimeout(Duration),
    UnexpectedResponse,
    Cancelled,
}

/// Loads missing history for `(symbol, granularity)` pairs into a [`LocalStore`]
pub struct FetchOrchestrator {
    store: Arc<dyn LocalStore>,
    manager: Arc<ConnectionManager>,
    pacing: Arc<PacingGovernor>,
    analyzer: GapAnalyzer,
    planner: SegmentPlanner,
    retry: RetryPolicy,
    max_history: HashMap<Granularity, Duration>,
    request_timeout: Duration,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks,
}

impl FetchOrchestrator {
    /// Build the full stack (classifier, pacing, pool, planner) from a config
    pub fn from_config(
        config: &LoaderConfig,
        connector: Arc<dyn ProviderConnector>,
        store: Arc<dyn LocalStore>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let classifier = Arc::new(config.load_classifier()?);
        let pacing = PacingGovernor::new(config.pacing_limits())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let manager = ConnectionManager::new(connector, classifier, config.pool_settings());

        Ok(Self {
            store,
            manager: Arc::new(manager),
            pacing: Arc::new(pacing),
            analyzer: config.gap_analyzer()?,
            planner: SegmentPlanner::new(config.duration_limits()?),
            retry: config.retry_policy()?,
            max_history: config.max_history(),
            request_timeout: config.request_timeout(),
            clock: Arc::new(SystemClock),
            locks: KeyedLocks::new(),
        })
    }

    /// Resolve "now" through `clock`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a pacing governor with other orchestrators talking to the same provider
    pub fn with_pacing(mut self, pacing: Arc<PacingGovernor>) -> Self {
        self.pacing = pacing;
        self
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The connection pool
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// The pacing governor
    pub fn pacing(&self) -> &Arc<PacingGovernor> {
        &self.pacing
    }

    /// The cache
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Load with no external cancellation
    pub async fn load(&self, request: LoadRequest) -> Result<LoadOutcome, LoadFailure> {
        self.load_with_cancel(request, &CancelHandle::new()).await
    }

    /// Load, stopping before the next segment once `cancel` fires.
    ///
    /// Segments merged before cancellation stay in the cache and are
    /// returned; the outcome's diagnostics are flagged `cancelled`.
    pub async fn load_with_cancel(
        &self,
        request: LoadRequest,
        cancel: &CancelHandle,
    ) -> Result<LoadOutcome, LoadFailure> {
        // Spellings of one symbol share a cache file, so they must share a lock.
        let request = LoadRequest {
            symbol: normalize_symbol(&request.symbol),
            ..request
        };
        let span = info_span!(
            "load",
            symbol = %request.symbol,
            granularity = %request.granularity,
            mode = request.mode.as_str()
        );

        async {
            info!("Starting load");
            let result = self.run(&request, cancel).await;
            match &result {
                Ok(outcome) => {
                    metrics::record_load_completed(request.mode.as_str());
                    info!(
                        segments_planned = outcome.diagnostics.segments_planned,
                        segments_fetched = outcome.diagnostics.segments_fetched,
                        skipped = outcome.diagnostics.skipped_segments.len(),
                        rows = outcome.rows.len(),
                        cancelled = outcome.diagnostics.cancelled,
                        "Load finished"
                    );
                }
                Err(failure) => {
                    metrics::record_load_failed(failure.error.phase().as_str());
                    error!(
                        phase = %failure.error.phase(),
                        error = %failure.error,
                        "Load failed"
                    );
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Run several loads concurrently; loads of the same pair run one after another
    pub async fn load_many(
        &self,
        requests: Vec<LoadRequest>,
        cancel: &CancelHandle,
    ) -> Vec<Result<LoadOutcome, LoadFailure>> {
        join_all(
            requests
                .into_iter()
                .map(|request| self.load_with_cancel(request, cancel)),
        )
        .await
    }

    async fn run(
        &self,
        request: &LoadRequest,
        cancel: &CancelHandle,
    ) -> Result<LoadOutcome, LoadFailure> {
        if request.symbol.trim().is_empty() {
            return Err(LoadError::Configuration("symbol must not be empty".to_string()).into());
        }

        let key = SeriesKey::new(request.symbol.clone(), request.granularity);
        let _guard = self.locks.lock(&key).await;

        let mut diagnostics = LoadDiagnostics::default();
        let Some(target) = self.resolve_target(request, &mut diagnostics).await? else {
            info!("Cache already current, nothing to fetch");
            return Ok(LoadOutcome {
                rows: Vec::new(),
                diagnostics,
                target: None,
            });
        };

        let coverage = self
            .store
            .coverage(&request.symbol, request.granularity)
            .await
            .map_err(LoadError::from)?;
        let missing = self
            .analyzer
            .analyze(&request.symbol, request.granularity, &coverage, target);
        let direction = match request.mode {
            LoadMode::Tail => PlanDirection::NewestFirst,
            LoadMode::Backfill | LoadMode::Full => PlanDirection::OldestFirst,
        };
        let segments = self
            .planner
            .plan_all(&missing, request.granularity, direction);

        diagnostics.gaps_analyzed = missing.len();
        diagnostics.segments_planned = segments.len();
        info!(
            target = %target,
            gaps = missing.len(),
            segments = segments.len(),
            "Load planned"
        );

        for segment in &segments {
            if cancel.is_cancelled() {
                diagnostics.cancelled = true;
                break;
            }

            match self
                .fetch_segment(&request.symbol, segment, &mut diagnostics, cancel)
                .await
            {
                SegmentResult::Fetched(rows) => {
                    if let Err(e) = self
                        .merge_segment(&request.symbol, segment, rows, &mut diagnostics)
                        .await
                    {
                        return Err(self.fail(e, request, target, diagnostics).await);
                    }
                }
                SegmentResult::Skipped(skipped) => {
                    warn!(
                        range = %skipped.range,
                        kind = %skipped.kind,
                        attempts = skipped.attempts,
                        reason = %skipped.reason,
                        "Skipping segment"
                    );
                    metrics::record_segment_skipped(skipped.kind);
                    let exhausted_only_segment = segments.len() == 1 && skipped.kind.is_retryable();
                    let error = exhausted_only_segment.then(|| exhausted_error(&skipped));
                    diagnostics.skipped_segments.push(skipped);
                    if let Some(error) = error {
                        return Err(self.fail(error, request, target, diagnostics).await);
                    }
                }
                SegmentResult::Cancelled => {
                    diagnostics.cancelled = true;
                    break;
                }
                SegmentResult::Failed(error) => {
                    return Err(self.fail(error, request, target, diagnostics).await);
                }
            }
        }

        if diagnostics.cancelled {
            info!(
                segments_fetched = diagnostics.segments_fetched,
                "Load cancelled, keeping merged segments"
            );
        }

        let rows = self
            .store
            .read(&request.symbol, request.granularity, target)
            .await
            .map_err(LoadError::from)?;
        Ok(LoadOutcome {
            rows,
            diagnostics,
            target: Some(target),
        })
    }

    /// Target range for a request; `None` when the cache is already current
    async fn resolve_target(
        &self,
        request: &LoadRequest,
        diagnostics: &mut LoadDiagnostics,
    ) -> Result<Option<TimeRange>, LoadError> {
        if let Some(range) = request.range {
            return Ok(Some(range));
        }

        let now = self.clock.now_millis();
        let cached = self
            .store
            .bounds(&request.symbol, request.granularity)
            .await?;

        let target = match (request.mode, cached) {
            (LoadMode::Tail, Some(cached)) => TimeRange::new(cached.end(), now).ok(),
            (LoadMode::Backfill, Some(cached)) => {
                let span = self.planner.limits().max_duration_ms(request.granularity);
                TimeRange::new(cached.start().saturating_sub(span), cached.start()).ok()
            }
            (LoadMode::Full, _) | (_, None) => {
                if cached.is_none() {
                    debug!("No cached coverage, loading full history");
                }
                self.full_range(&request.symbol, request.granularity, now, diagnostics)
                    .await
            }
        };
        Ok(target)
    }

    async fn full_range(
        &self,
        symbol: &str,
        granularity: Granularity,
        now: i64,
        diagnostics: &mut LoadDiagnostics,
    ) -> Option<TimeRange> {
        let depth = self
            .max_history
            .get(&granularity)
            .copied()
            .unwrap_or_else(|| default_max_history(granularity));
        let earliest = now.saturating_sub(depth.as_millis() as i64);
        let start = match self.head_timestamp(symbol, diagnostics).await {
            Some(head) => head.max(earliest),
            None => earliest,
        };
        TimeRange::new(start, now).ok()
    }

    /// Earliest timestamp the provider holds; any failure means "unknown"
    async fn head_timestamp(&self, symbol: &str, diagnostics: &mut LoadDiagnostics) -> Option<i64> {
        let paced = timeout(
            self.request_timeout,
            self.pacing.wait_if_needed(RequestCategory::HeadTimestamp),
        )
        .await;
        if paced.is_err() {
            warn!("Pacing wait for head timestamp timed out");
            return None;
        }

        let connection = match self.manager.acquire().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "No connection for head timestamp lookup");
                return None;
            }
        };
        diagnostics.provider_calls_made += 1;
        match connection.submit(Request::head_timestamp(symbol)).await {
            Ok(Response::HeadTimestamp(head)) => head,
            Ok(Response::Bars(_)) => None,
            Err(e) => {
                warn!(error = %e, "Head timestamp lookup failed, using history depth");
                None
            }
        }
    }

    async fn fetch_segment(
        &self,
        symbol: &str,
        segment: &Segment,
        diagnostics: &mut LoadDiagnostics,
        cancel: &CancelHandle,
    ) -> SegmentResult {
        let skipped = |kind, reason: String, attempts| {
            SegmentResult::Skipped(SkippedSegment {
                range: segment.range,
                kind,
                reason,
                attempts,
            })
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (classification, reason) = match self
                .attempt(symbol, segment, attempt, diagnostics, cancel)
                .await
            {
                Ok(rows) => {
                    let rows = valid_rows(rows);
                    if rows.is_empty() {
                        return skipped(
                            ErrorKind::DataUnavailable,
                            "no rows returned".to_string(),
                            attempt,
                        );
                    }
                    return SegmentResult::Fetched(rows);
                }
                Err(AttemptError::Connection(e)) => {
                    return SegmentResult::Failed(LoadError::Connection(e));
                }
                Err(AttemptError::Cancelled) => return SegmentResult::Cancelled,
                Err(AttemptError::PacingTimeout(limit)) => (
                    ErrorClassification::new(ErrorKind::Pacing, 0),
                    format!("pacing wait exceeded {}s", limit.as_secs()),
                ),
                Err(AttemptError::Request(e)) => (e.classification(), e.to_string()),
                Err(AttemptError::UnexpectedResponse) => (
                    ErrorClassification::new(ErrorKind::Fatal, 0),
                    "unexpected response to a historical request".to_string(),
                ),
            };

            match self.retry.decide(attempt, &classification) {
                RetryDecision::Abort => {
                    return SegmentResult::Failed(LoadError::Fetch {
                        range: segment.range,
                        attempts: attempt,
                        reason,
                    });
                }
                RetryDecision::Skip => return skipped(ErrorKind::DataUnavailable, reason, attempt),
                RetryDecision::GiveUp => return skipped(classification.kind, reason, attempt),
                RetryDecision::Retry(delay) => {
                    diagnostics.retries += 1;
                    metrics::record_retry(classification.kind, delay);
                    warn!(
                        range = %segment.range,
                        attempt,
                        max_attempts = self.retry.max_attempts(),
                        kind = %classification.kind,
                        backoff_secs = delay.as_secs(),
                        reason = %reason,
                        "Retrying segment after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return SegmentResult::Cancelled,
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        symbol: &str,
        segment: &Segment,
        attempt: u32,
        diagnostics: &mut LoadDiagnostics,
        cancel: &CancelHandle,
    ) -> Result<Vec<Bar>, AttemptError> {
        let paced = tokio::select! {
            paced = timeout(
                self.request_timeout,
                self.pacing.wait_if_needed(RequestCategory::Historical),
            ) => paced,
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
        };
        paced.map_err(|_| AttemptError::PacingTimeout(self.request_timeout))?;

        let connection = tokio::select! {
            acquired = self.manager.acquire() => acquired.map_err(AttemptError::Connection)?,
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
        };
        diagnostics.provider_calls_made += 1;
        debug!(
            identity = connection.identity(),
            range = %segment.range,
            attempt,
            "Fetching segment"
        );

        let request = Request::historical(symbol, segment.granularity, segment.range)
            .with_attempts(self.retry.max_attempts().saturating_sub(attempt) + 1);
        match connection.submit(request).await {
            Ok(Response::Bars(rows)) => Ok(rows),
            Ok(Response::HeadTimestamp(_)) => Err(AttemptError::UnexpectedResponse),
            Err(e) => Err(AttemptError::Request(e)),
        }
    }

    async fn merge_segment(
        &self,
        symbol: &str,
        segment: &Segment,
        rows: Vec<Bar>,
        diagnostics: &mut LoadDiagnostics,
    ) -> Result<(), LoadError> {
        let outcome = self.store.merge(symbol, segment.granularity, rows).await?;
        let merged = outcome.inserted + outcome.replaced;
        diagnostics.segments_fetched += 1;
        diagnostics.rows_merged += merged;
        metrics::record_segment_fetched(merged);
        debug!(
            range = %segment.range,
            inserted = outcome.inserted,
            replaced = outcome.replaced,
            "Segment merged"
        );
        Ok(())
    }

    async fn fail(
        &self,
        error: LoadError,
        request: &LoadRequest,
        target: TimeRange,
        diagnostics: LoadDiagnostics,
    ) -> LoadFailure {
        let rows = match self
            .store
            .read(&request.symbol, request.granularity, target)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Could not read partial rows after failure");
                Vec::new()
            }
        };
        LoadFailure {
            error,
            partial: Some(LoadOutcome {
                rows,
                diagnostics,
                target: Some(target),
            }),
        }
    }
}

/// Drop rows that fail OHLCV validation
fn valid_rows(rows: Vec<Bar>) -> Vec<Bar> {
    rows.into_iter()
        .filter(|bar| match bar.validate() {
            Ok(()) => true,
            Err(reason) => {
                warn!(timestamp = bar.timestamp, %reason, "Dropping invalid bar");
                false
            }
        })
        .collect()
}

fn exhausted_error(skipped: &SkippedSegment) -> LoadError {
    if skipped.kind == ErrorKind::Pacing {
        LoadError::Pacing {
            range: skipped.range,
            attempts: skipped.attempts,
            reason: skipped.reason.clone(),
        }
    } else {
        LoadError::Fetch {
            range: skipped.range,
            attempts: skipped.attempts,
            reason: skipped.reason.clone(),
        }
    }
}
