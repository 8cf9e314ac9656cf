//! Facet investigation: which dimension values explain a window of traffic.
//!
//! For every configured facet one aggregation query counts requests per
//! (minute, dimension value), then folds the minutes into an "inside the
//! window" bucket and a "baseline" bucket (the rest of the analysis range).
//! Counts are normalised to per-minute rates so windows of different length
//! compare, and each value's share of the window is compared with its share
//! of the baseline. Over-representation is the main signal.

pub mod executor;

pub use executor::{ClickHouseExecutor, QueryError, QueryExecutor};

use crate::cache::{AnomalyRef, InvestigationCache};
use crate::config::{FacetConfig, InvestigationConfig};
use crate::detect::{AnomalyType, Category, TimeWindow};
use crate::filters::QueryContext;
use crate::identity::AnomalyId;
use crate::storage::KvStore;
use futures::future::join_all;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum InvestigateError {
    #[error("facet '{facet}' query failed: {source}")]
    Facet {
        facet: String,
        #[source]
        source: QueryError,
    },

    #[error("facet '{facet}' returned an unexpected row: {message}")]
    Row { facet: String, message: String },
}

impl InvestigateError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InvestigateError::Facet { source, .. } if source.is_cancelled())
    }
}

/// Hard ceiling on findings per facet and in the overall top list.
pub const MAX_RESULTS: usize = 5;

/// The window being explained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum InvestigationTarget {
    /// A detected anomaly, scoped to its category.
    Anomaly {
        window: TimeWindow,
        category: Category,
        kind: AnomalyType,
    },
    /// An operator-selected window over all traffic.
    Selection { window: TimeWindow },
}

impl InvestigationTarget {
    pub fn window(&self) -> TimeWindow {
        match self {
            InvestigationTarget::Anomaly { window, .. } => *window,
            InvestigationTarget::Selection { window } => *window,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            InvestigationTarget::Anomaly { .. } => "anomaly",
            InvestigationTarget::Selection { .. } => "selection",
        }
    }

    /// Filter-independent handle for caching; selections are never cached.
    pub fn anomaly_ref(&self) -> Option<AnomalyRef> {
        match self {
            InvestigationTarget::Anomaly { window, category, .. } => Some(AnomalyRef::new(*window, *category)),
            InvestigationTarget::Selection { .. } => None,
        }
    }
}

/// Everything one investigation run needs.
#[derive(Debug, Clone)]
pub struct InvestigationRequest {
    /// Scope of the run. `host_filter` is a SQL condition (or empty);
    /// `time_filter` only identifies the scope, the SQL time bounds come from `range`.
    pub context: QueryContext,
    /// Compiled filter SQL (`AND ...` or empty).
    pub filters_sql: String,
    /// Full analysis range containing the window.
    pub range: TimeWindow,
    pub target: InvestigationTarget,
}

impl InvestigationRequest {
    /// Id of the target anomaly under this request's scope.
    pub fn anomaly_id(&self) -> Option<AnomalyId> {
        self.target
            .anomaly_ref()
            .map(|a| a.id_under(&self.context.time_filter, &self.context.filter_map))
    }
}

/// Per-request switches that would otherwise be process-wide flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvestigationOptions {
    /// Skip the cache read; the fresh result is still written back.
    pub force_refresh: bool,
}

/// Relative change of a per-minute rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateChange {
    Percent(f64),
    /// No baseline traffic; the value only appears inside the window.
    New,
}

/// One over- or under-represented dimension value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetFinding {
    pub facet: String,
    pub dim: String,
    pub window_rate: f64,
    pub baseline_rate: f64,
    pub rate_change: RateChange,
    pub window_share: f64,
    pub baseline_share: f64,
    /// Percentage points.
    pub share_change: f64,
    /// Anomaly mode: error rate inside minus outside, percentage points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_rate_change: Option<f64>,
    /// Selection mode: share of all errors inside minus outside, percentage points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_share_change: Option<f64>,
    pub significance: f64,
}

/// Aggregated counts for one dimension value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FacetRow {
    #[serde(deserialize_with = "de_dim")]
    pub dim: String,
    #[serde(default, deserialize_with = "de_count")]
    pub window_total: f64,
    #[serde(default, deserialize_with = "de_count")]
    pub baseline_total: f64,
    #[serde(default, deserialize_with = "de_count")]
    pub window_matched: f64,
    #[serde(default, deserialize_with = "de_count")]
    pub baseline_matched: f64,
    #[serde(default, deserialize_with = "de_count")]
    pub window_errors: f64,
    #[serde(default, deserialize_with = "de_count")]
    pub baseline_errors: f64,
}

// 64-bit integers come back quoted from ClickHouse.
fn de_count<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    use serde::de::Error;
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| D::Error::custom("count out of range")),
        serde_json::Value::String(s) => s.parse::<f64>().map_err(D::Error::custom),
        serde_json::Value::Null => Ok(0.0),
        other => Err(D::Error::custom(format!("expected a count, got {}", other))),
    }
}

fn de_dim<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn sql_time(t: chrono::DateTime<chrono::Utc>) -> String {
    format!("toDateTime('{}', 'UTC')", t.format("%Y-%m-%d %H:%M:%S"))
}

fn matched_condition(target: &InvestigationTarget, status: &str) -> String {
    match target {
        InvestigationTarget::Anomaly { category, .. } => match category {
            Category::Red => format!("{} >= 500", status),
            Category::Yellow => format!("{} >= 400 AND {} < 500", status, status),
            Category::Green => format!("{} < 400", status),
        },
        InvestigationTarget::Selection { .. } => "1".to_string(),
    }
}

/// Two-level aggregation for one facet. The inner level groups by minute so
/// the query can be served from minute pre-aggregates.
pub fn build_facet_query(
    facet: &FacetConfig,
    request: &InvestigationRequest,
    config: &InvestigationConfig,
) -> String {
    let window = request.target.window();
    let ts = &config.timestamp_column;
    let status = &config.status_column;
    let in_window = format!(
        "minute >= {} AND minute < {}",
        sql_time(window.start),
        sql_time(window.end)
    );
    let host = if request.context.host_filter.trim().is_empty() {
        String::new()
    } else {
        format!(" AND ({})", request.context.host_filter)
    };

    format!(
        "SELECT
  dim,
  sumIf(cnt, {in_window}) AS window_total,
  sumIf(cnt, NOT ({in_window})) AS baseline_total,
  sumIf(matched, {in_window}) AS window_matched,
  sumIf(matched, NOT ({in_window})) AS baseline_matched,
  sumIf(errors, {in_window}) AS window_errors,
  sumIf(errors, NOT ({in_window})) AS baseline_errors
FROM (
  SELECT
    toStartOfMinute({ts}) AS minute,
    {expr} AS dim,
    count() AS cnt,
    countIf({matched}) AS matched,
    countIf({status} >= 400) AS errors
  FROM {table}
  WHERE {ts} >= {range_start} AND {ts} < {range_end}{host}{filters}
  GROUP BY minute, dim
)
GROUP BY dim
ORDER BY window_matched DESC, baseline_matched DESC
LIMIT {limit}",
        in_window = in_window,
        ts = ts,
        expr = facet.expression,
        matched = matched_condition(&request.target, status),
        status = status,
        table = config.table,
        range_start = sql_time(request.range.start),
        range_end = sql_time(request.range.end),
        host = host,
        filters = request.filters_sql,
        limit = config.row_limit,
    )
}

fn pct(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

fn rate_change(window_rate: f64, baseline_rate: f64) -> RateChange {
    if baseline_rate > 0.0 {
        RateChange::Percent(round1((window_rate - baseline_rate) / baseline_rate * 100.0))
    } else if window_rate > 0.0 {
        RateChange::New
    } else {
        RateChange::Percent(0.0)
    }
}

/// Turn aggregated rows into ranked findings.
pub fn score_rows(
    facet: &str,
    rows: &[FacetRow],
    target: &InvestigationTarget,
    range: &TimeWindow,
    config: &InvestigationConfig,
) -> Vec<FacetFinding> {
    let window = target.window();
    let window_minutes = window.minutes();
    let baseline_minutes = (range.minutes() - window_minutes).max(1.0);
    let threshold = config.min_change_pct;

    let sum_window: f64 = rows.iter().map(|r| r.window_matched).sum();
    let sum_baseline: f64 = rows.iter().map(|r| r.baseline_matched).sum();
    let sum_window_errors: f64 = rows.iter().map(|r| r.window_errors).sum();
    let sum_baseline_errors: f64 = rows.iter().map(|r| r.baseline_errors).sum();

    let mut findings: Vec<FacetFinding> = rows
        .iter()
        .filter_map(|row| {
            let window_rate = row.window_matched / window_minutes;
            let baseline_rate = row.baseline_matched / baseline_minutes;
            if window_rate <= config.min_rate_per_minute && baseline_rate <= config.min_rate_per_minute {
                return None;
            }

            let window_share = pct(row.window_matched, sum_window);
            let baseline_share = pct(row.baseline_matched, sum_baseline);
            let share_change = window_share - baseline_share;

            let (error_rate_change, error_share_change, significance) = match target {
                InvestigationTarget::Anomaly { category, kind, .. } => {
                    let err_change = pct(row.window_errors, row.window_total)
                        - pct(row.baseline_errors, row.baseline_total);
                    let share_signal = match kind {
                        AnomalyType::Spike if share_change > threshold => Some(share_change),
                        AnomalyType::Dip if share_change < -threshold => Some(-share_change),
                        _ => None,
                    };
                    let err_signal = (category.is_error() && err_change > threshold).then_some(err_change);
                    let significance = share_signal.into_iter().chain(err_signal).reduce(f64::max)?;
                    (Some(err_change), None, significance)
                }
                InvestigationTarget::Selection { .. } => {
                    let err_change = pct(row.window_errors, sum_window_errors)
                        - pct(row.baseline_errors, sum_baseline_errors);
                    let significance = share_change.abs().max(err_change.abs());
                    if significance <= threshold {
                        return None;
                    }
                    (None, Some(err_change), significance)
                }
            };

            Some(FacetFinding {
                facet: facet.to_string(),
                dim: row.dim.clone(),
                window_rate: round1(window_rate),
                baseline_rate: round1(baseline_rate),
                rate_change: rate_change(window_rate, baseline_rate),
                window_share: round1(window_share),
                baseline_share: round1(baseline_share),
                share_change: round1(share_change),
                error_rate_change: error_rate_change.map(round1),
                error_share_change: error_share_change.map(round1),
                significance: round1(significance),
            })
        })
        .collect();

    sort_findings(&mut findings);
    findings.truncate(config.max_results.min(MAX_RESULTS));
    findings
}

fn sort_findings(findings: &mut [FacetFinding]) {
    findings.sort_by(|a, b| {
        b.significance
            .total_cmp(&a.significance)
            .then_with(|| a.facet.cmp(&b.facet))
            .then_with(|| a.dim.cmp(&b.dim))
    });
}

// ---------------------------------------------------------------------------
// Generations
// ---------------------------------------------------------------------------

struct TrackerState {
    generation: AtomicU64,
    token: Mutex<CancellationToken>,
}

/// Hands out tickets for investigation runs and invalidates them when the
/// query scope changes.
#[derive(Clone)]
pub struct InvestigationTracker {
    state: Arc<TrackerState>,
}

impl Default for InvestigationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InvestigationTracker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TrackerState {
                generation: AtomicU64::new(0),
                token: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.generation.load(Ordering::SeqCst)
    }

    /// Start a run under the current generation.
    pub fn begin(&self) -> Ticket {
        let token = self
            .state
            .token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .child_token();
        Ticket {
            generation: self.generation(),
            token,
            state: Arc::clone(&self.state),
        }
    }

    /// The scope changed: cancel in-flight queries and retire their tickets.
    pub fn supersede(&self) {
        let mut token = self.state.token.lock().unwrap_or_else(|e| e.into_inner());
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        token.cancel();
        *token = CancellationToken::new();
    }
}

/// Proof that a run started under a particular generation.
pub struct Ticket {
    generation: u64,
    token: CancellationToken,
    state: Arc<TrackerState>,
}

impl Ticket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_current(&self) -> bool {
        self.state.generation.load(Ordering::SeqCst) == self.generation
    }
}

// ---------------------------------------------------------------------------
// Investigator
// ---------------------------------------------------------------------------

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Investigation {
    pub run_id: Uuid,
    pub mode: &'static str,
    /// Findings per facet. Empty when served from cache.
    pub facets: BTreeMap<String, Vec<FacetFinding>>,
    /// Best findings across all facets.
    pub top_contributors: Vec<FacetFinding>,
    /// Set for anomaly targets, computed under the request's current filters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly_id: Option<AnomalyId>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvestigationOutcome {
    Completed(Investigation),
    /// The scope changed while queries were in flight; results were discarded.
    Superseded,
}

pub struct FacetInvestigator<E> {
    executor: Arc<E>,
    config: InvestigationConfig,
}

impl<E: QueryExecutor> FacetInvestigator<E> {
    pub fn new(executor: Arc<E>, config: InvestigationConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &InvestigationConfig {
        &self.config
    }

    /// Query and score a single facet.
    pub async fn investigate_facet(
        &self,
        facet: &FacetConfig,
        request: &InvestigationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<FacetFinding>, InvestigateError> {
        let sql = build_facet_query(facet, request, &self.config);
        let raw = self
            .executor
            .run_aggregation(&sql, cancel)
            .await
            .map_err(|source| InvestigateError::Facet {
                facet: facet.name.clone(),
                source,
            })?;

        let rows = raw
            .into_iter()
            .map(serde_json::from_value::<FacetRow>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| InvestigateError::Row {
                facet: facet.name.clone(),
                message: e.to_string(),
            })?;

        Ok(score_rows(&facet.name, &rows, &request.target, &request.range, &self.config))
    }

    /// Run every facet concurrently. A failing facet contributes an empty
    /// list; the run as a whole only stops being useful if it is superseded.
    pub async fn investigate(&self, request: &InvestigationRequest, ticket: &Ticket) -> InvestigationOutcome {
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            mode = request.target.mode(),
            facets = self.config.facets.len(),
            generation = ticket.generation(),
            "starting investigation"
        );

        let runs = self.config.facets.iter().map(|facet| async move {
            let findings = match self.investigate_facet(facet, request, ticket.token()).await {
                Ok(findings) => findings,
                Err(e) if e.is_cancelled() => {
                    debug!(%run_id, facet = %facet.name, "facet query cancelled");
                    Vec::new()
                }
                Err(e) => {
                    warn!(%run_id, facet = %facet.name, error = %e, "facet query failed");
                    Vec::new()
                }
            };
            (facet.name.clone(), findings)
        });
        let facets: BTreeMap<String, Vec<FacetFinding>> = join_all(runs).await.into_iter().collect();

        if !ticket.is_current() {
            debug!(%run_id, "investigation superseded, discarding results");
            return InvestigationOutcome::Superseded;
        }

        let mut top: Vec<FacetFinding> = facets.values().flatten().cloned().collect();
        sort_findings(&mut top);
        top.truncate(self.config.max_results.min(MAX_RESULTS));

        info!(%run_id, findings = top.len(), "investigation complete");
        InvestigationOutcome::Completed(Investigation {
            run_id,
            mode: request.target.mode(),
            facets,
            top_contributors: top,
            anomaly_id: request.anomaly_id(),
            from_cache: false,
        })
    }

    /// `investigate`, answered from and recorded into `cache` when the
    /// target is an anomaly.
    pub async fn investigate_cached<S: KvStore>(
        &self,
        request: &InvestigationRequest,
        options: InvestigationOptions,
        cache: &InvestigationCache<S>,
        ticket: &Ticket,
    ) -> InvestigationOutcome {
        let anomaly = request.target.anomaly_ref();
        if let (Some(anomaly), false) = (&anomaly, options.force_refresh) {
            if let Some(top) = cache.lookup(&request.context, anomaly) {
                let anomaly_id = request.anomaly_id();
                debug!(id = ?anomaly_id, "investigation served from cache");
                return InvestigationOutcome::Completed(Investigation {
                    run_id: Uuid::new_v4(),
                    mode: request.target.mode(),
                    facets: BTreeMap::new(),
                    top_contributors: top,
                    anomaly_id,
                    from_cache: true,
                });
            }
        }

        let outcome = self.investigate(request, ticket).await;
        if let (InvestigationOutcome::Completed(inv), Some(anomaly)) = (&outcome, &anomaly) {
            cache.record(&request.context, anomaly, inv.top_contributors.clone());
        }
        outcome
    }
}
