//! Plans fetch units for a run and executes them on a bounded worker pool.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use ohp_adapters::{
    DiscoveryClient, DiscoveryFailure, FetchError, FetchOptions, PageFetcher, RetryDisposition,
    RetryPolicy,
};
use ohp_core::{
    ChangeVerdict, FetchTarget, FetchUnit, HarvestMode, RawRecord, SensitivityPolicy,
};
use ohp_storage::{FingerprintStore, RecordDigests, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::{Clock, DiscoveryCache};
use crate::change::classify;
use crate::config::{LeagueSelector, MarketSelector, RunRequest};
use crate::intersect::{intersect, Intersection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum UnitState {
    Pending,
    InFlight { attempt: usize },
    Retrying { attempt: usize },
    Succeeded,
    Failed,
}

impl UnitState {
    pub fn can_transition_to(&self, next: &UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Pending, InFlight { .. })
                | (InFlight { .. }, Retrying { .. })
                | (Retrying { .. }, InFlight { .. })
                | (InFlight { .. }, Succeeded)
                | (InFlight { .. }, Failed)
                | (Retrying { .. }, Failed)
        )
    }

    fn advance(&mut self, next: UnitState) {
        debug_assert!(self.can_transition_to(&next), "{self:?} -> {next:?}");
        debug!(from = ?self, to = ?next, "unit state");
        *self = next;
    }
}

/// A unit (or league during planning) that produced no records, with why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub unit: String,
    pub kind: String,
    pub reason: String,
    pub attempts: usize,
}

impl FailedUnit {
    fn from_fetch(unit: &str, err: &FetchError, attempts: usize) -> Self {
        Self {
            unit: unit.to_string(),
            kind: err.kind().to_string(),
            reason: err.to_string(),
            attempts,
        }
    }

    fn from_store(unit: &str, err: &StoreError, attempts: usize) -> Self {
        Self {
            unit: unit.to_string(),
            kind: "store_error".to_string(),
            reason: err.to_string(),
            attempts,
        }
    }

    fn from_discovery(unit: String, failure: &DiscoveryFailure) -> Self {
        Self {
            unit,
            kind: "discovery_failure".to_string(),
            reason: failure.reason.clone(),
            attempts: 1,
        }
    }
}

/// A record worth handing to the storage writer, tagged with the unit that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedRecord {
    pub unit: String,
    pub verdict: ChangeVerdict,
    pub record: RawRecord,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictCounts {
    pub new: usize,
    pub unchanged: usize,
    pub changed_odds: usize,
    pub changed_history: usize,
}

impl VerdictCounts {
    pub fn record(&mut self, verdict: ChangeVerdict) {
        match verdict {
            ChangeVerdict::New => self.new += 1,
            ChangeVerdict::Unchanged => self.unchanged += 1,
            ChangeVerdict::ChangedOdds => self.changed_odds += 1,
            ChangeVerdict::ChangedHistory => self.changed_history += 1,
        }
    }

    fn merge(&mut self, other: VerdictCounts) {
        self.new += other.new;
        self.unchanged += other.unchanged;
        self.changed_odds += other.changed_odds;
        self.changed_history += other.changed_history;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sport: String,
    pub mode: HarvestMode,
    pub sensitivity: SensitivityPolicy,
    pub planned_units: usize,
    pub new_count: usize,
    pub unchanged_count: usize,
    pub changed_odds_count: usize,
    pub changed_history_count: usize,
    pub succeeded_units: usize,
    pub cancelled_units: Vec<String>,
    pub failed_units: Vec<FailedUnit>,
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn changed_count(&self) -> usize {
        self.changed_odds_count + self.changed_history_count
    }

    pub fn total_records(&self) -> usize {
        self.new_count + self.unchanged_count + self.changed_count()
    }

    /// Percentage of classified records that needed no write.
    pub fn skip_efficiency(&self) -> f64 {
        let total = self.total_records();
        if total == 0 {
            return 0.0;
        }
        self.unchanged_count as f64 / total as f64 * 100.0
    }

    fn apply_counts(&mut self, counts: VerdictCounts) {
        self.new_count = counts.new;
        self.unchanged_count = counts.unchanged;
        self.changed_odds_count = counts.changed_odds;
        self.changed_history_count = counts.changed_history;
    }
}

/// Fingerprint write held back until the accepted record has been delivered.
pub type PendingFingerprint = (String, RecordDigests);

#[derive(Debug, Clone)]
pub struct HarvestOutcome {
    pub summary: RunSummary,
    pub accepted: Vec<AcceptedRecord>,
    /// Committed by [`HarvestCoordinator::commit_fingerprints`] once the sink has the records.
    pub pending_fingerprints: Vec<PendingFingerprint>,
}

#[derive(Debug, Default)]
struct Plan {
    units: Vec<FetchUnit>,
    failures: Vec<FailedUnit>,
    warnings: Vec<String>,
}

#[derive(Debug)]
enum UnitOutcome {
    Succeeded(Classified),
    Failed(FailedUnit),
    Cancelled(String),
}

#[derive(Debug, Default)]
struct Classified {
    counts: VerdictCounts,
    accepted: Vec<AcceptedRecord>,
    pending: Vec<PendingFingerprint>,
}

#[derive(Debug, Default)]
struct Execution {
    counts: VerdictCounts,
    succeeded: usize,
    failed: Vec<FailedUnit>,
    cancelled: Vec<String>,
    accepted: Vec<AcceptedRecord>,
    pending: Vec<PendingFingerprint>,
}

impl Execution {
    fn absorb(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Succeeded(classified) => {
                self.succeeded += 1;
                self.counts.merge(classified.counts);
                self.accepted.extend(classified.accepted);
                self.pending.extend(classified.pending);
            }
            UnitOutcome::Failed(failed) => self.failed.push(failed),
            UnitOutcome::Cancelled(unit) => self.cancelled.push(unit),
        }
    }
}

pub struct HarvestCoordinator {
    discovery: Arc<dyn DiscoveryClient>,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn FingerprintStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    discovery_ttl: TimeDelta,
}

impl HarvestCoordinator {
    pub fn new(
        discovery: Arc<dyn DiscoveryClient>,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn FingerprintStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            discovery,
            fetcher,
            store,
            clock,
            retry: RetryPolicy::default(),
            discovery_ttl: TimeDelta::minutes(30),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_discovery_ttl(mut self, ttl: TimeDelta) -> Self {
        self.discovery_ttl = ttl;
        self
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Runs one harvest. Per-unit and per-league failures land in the summary;
    /// nothing here is fatal once the request has been validated.
    ///
    /// The fingerprint store is only read here. Accepted records come back with
    /// their pending fingerprints, which the caller commits after delivery.
    pub async fn run(&self, request: &RunRequest, cancel: CancellationToken) -> HarvestOutcome {
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let span = info_span!("harvest_run", %run_id, sport = %request.sport, mode = %request.mode);
        async move {
            let cache = DiscoveryCache::new(self.discovery.clone(), self.clock.clone(), self.discovery_ttl);
            let plan = self.plan(request, &cache, &cancel).await;
            info!(
                units = plan.units.len(),
                planning_failures = plan.failures.len(),
                discovery_lookups = cache.remote_calls(),
                "harvest plan ready"
            );

            let planned_units = plan.units.len();
            let execution = self.execute(run_id, plan.units, request, &cancel).await;

            let mut summary = RunSummary {
                run_id,
                started_at,
                finished_at: self.clock.now(),
                sport: request.sport.clone(),
                mode: request.mode,
                sensitivity: request.sensitivity,
                planned_units,
                new_count: 0,
                unchanged_count: 0,
                changed_odds_count: 0,
                changed_history_count: 0,
                succeeded_units: execution.succeeded,
                cancelled_units: execution.cancelled,
                failed_units: plan.failures,
                warnings: plan.warnings,
            };
            summary.apply_counts(execution.counts);
            summary.failed_units.extend(execution.failed);
            summary.failed_units.sort_by(|a, b| a.unit.cmp(&b.unit));
            summary.cancelled_units.sort();

            info!(
                succeeded = summary.succeeded_units,
                failed = summary.failed_units.len(),
                cancelled = summary.cancelled_units.len(),
                new = summary.new_count,
                changed = summary.changed_count(),
                unchanged = summary.unchanged_count,
                "harvest run finished"
            );
            HarvestOutcome {
                summary,
                accepted: execution.accepted,
                pending_fingerprints: execution.pending,
            }
        }
        .instrument(span)
        .await
    }

    /// Marks the outcome's accepted records as seen, stamped with the run's finish time.
    pub async fn commit_fingerprints(&self, outcome: &HarvestOutcome) -> Result<(), StoreError> {
        self.store
            .upsert_many(&outcome.pending_fingerprints, outcome.summary.finished_at)
            .await?;
        debug!(
            run_id = %outcome.summary.run_id,
            written = outcome.pending_fingerprints.len(),
            "fingerprints committed"
        );
        Ok(())
    }

    async fn plan(&self, request: &RunRequest, cache: &DiscoveryCache, cancel: &CancellationToken) -> Plan {
        let mut plan = Plan::default();
        let markets = self.resolve_markets(request, cache, &mut plan).await;

        if !request.match_links.is_empty() {
            plan.units = request
                .match_links
                .iter()
                .map(|link| FetchUnit {
                    sport: request.sport.clone(),
                    league: None,
                    target: FetchTarget::Match(link.clone()),
                    markets: markets.clone(),
                })
                .collect();
            return plan;
        }

        match request.mode {
            HarvestMode::Upcoming => {
                let leagues: Vec<Option<String>> = match &request.leagues {
                    LeagueSelector::All => vec![None],
                    LeagueSelector::Only(leagues) => leagues.iter().cloned().map(Some).collect(),
                };
                for league in leagues {
                    plan.units.extend(request.range.dates().map(|date| FetchUnit {
                        sport: request.sport.clone(),
                        league: league.clone(),
                        target: FetchTarget::Date(date),
                        markets: markets.clone(),
                    }));
                }
            }
            HarvestMode::Historic => {
                let leagues = match &request.leagues {
                    LeagueSelector::Only(leagues) => leagues.clone(),
                    LeagueSelector::All => match cache.list_leagues(&request.sport).await {
                        Ok(leagues) => leagues,
                        Err(failure) => {
                            warn!(error = %failure, "league discovery failed; nothing to plan");
                            plan.failures
                                .push(FailedUnit::from_discovery(format!("{}/*", request.sport), &failure));
                            return plan;
                        }
                    },
                };
                for league in leagues {
                    if cancel.is_cancelled() {
                        plan.warnings
                            .push(format!("run cancelled before league {league} was planned"));
                        continue;
                    }
                    match intersect(&request.sport, &league, &markets, &request.range, cache).await {
                        Ok(Intersection::Units(units)) => {
                            debug!(%league, units = units.len(), "league intersected");
                            plan.units.extend(units);
                        }
                        Ok(Intersection::NoOverlap(warning)) => {
                            warn!(%warning, "no overlapping seasons");
                            plan.warnings.push(warning.to_string());
                        }
                        Err(failure) => {
                            warn!(%league, error = %failure, "season discovery failed; skipping league");
                            plan.failures.push(FailedUnit::from_discovery(
                                format!("{}/{league}", request.sport),
                                &failure,
                            ));
                        }
                    }
                }
            }
        }
        plan
    }

    async fn resolve_markets(
        &self,
        request: &RunRequest,
        cache: &DiscoveryCache,
        plan: &mut Plan,
    ) -> BTreeSet<String> {
        let wanted = match &request.markets {
            MarketSelector::Auto => return BTreeSet::new(),
            MarketSelector::All => None,
            MarketSelector::Only(wanted) => Some(wanted),
        };
        let available = match cache.list_markets(&request.sport).await {
            Ok(available) => available,
            Err(failure) => {
                warn!(error = %failure, "market discovery failed");
                plan.warnings.push(format!("market discovery failed: {failure}"));
                return wanted.cloned().unwrap_or_default();
            }
        };
        let Some(wanted) = wanted else {
            return available;
        };

        let available_lower: BTreeMap<String, &String> =
            available.iter().map(|m| (m.to_lowercase(), m)).collect();
        let mut kept = BTreeSet::new();
        let mut dropped = Vec::new();
        for market in wanted {
            match available_lower.get(&market.to_lowercase()) {
                Some(label) => {
                    kept.insert((*label).clone());
                }
                None => dropped.push(market.clone()),
            }
        }
        if !dropped.is_empty() {
            warn!(?dropped, "requested markets not offered for sport");
            plan.warnings
                .push(format!("unknown markets dropped: {}", dropped.join(", ")));
        }
        if kept.is_empty() {
            // Keep the request rather than silently widening to the page defaults.
            return wanted.clone();
        }
        kept
    }

    async fn execute(
        &self,
        run_id: Uuid,
        units: Vec<FetchUnit>,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Execution {
        let semaphore = Arc::new(Semaphore::new(request.concurrency.max(1)));
        let options = request.fetch_options();
        let mut tasks = JoinSet::new();

        for unit in units {
            let worker = UnitWorker {
                run_id,
                fetcher: self.fetcher.clone(),
                store: self.store.clone(),
                retry: self.retry,
                sensitivity: request.sensitivity,
                options: options.clone(),
                cancel: cancel.clone(),
            };
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return UnitOutcome::Cancelled(unit.key());
                };
                if worker.cancel.is_cancelled() {
                    return UnitOutcome::Cancelled(unit.key());
                }
                worker.run(unit).await
            });
        }

        let mut execution = Execution::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => execution.absorb(outcome),
                Err(err) => {
                    error!(error = %err, "unit task aborted");
                    execution.failed.push(FailedUnit {
                        unit: "unknown".to_string(),
                        kind: "task_aborted".to_string(),
                        reason: err.to_string(),
                        attempts: 0,
                    });
                }
            }
        }
        execution
    }
}

struct UnitWorker {
    run_id: Uuid,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn FingerprintStore>,
    retry: RetryPolicy,
    sensitivity: SensitivityPolicy,
    options: FetchOptions,
    cancel: CancellationToken,
}

impl UnitWorker {
    async fn run(self, unit: FetchUnit) -> UnitOutcome {
        let key = unit.key();
        let span = info_span!("harvest_unit", run_id = %self.run_id, unit = %key);
        async move {
            let mut state = UnitState::Pending;
            let mut attempt = 0usize;
            let records = loop {
                attempt += 1;
                state.advance(UnitState::InFlight { attempt });
                let err = match self.fetcher.fetch_unit(&unit, &self.options).await {
                    Ok(records) => break records,
                    Err(err) => err,
                };

                let retryable = err.disposition() == RetryDisposition::Retryable
                    && attempt < self.retry.max_attempts;
                if !retryable {
                    if err.cancels_run() {
                        error!(error = %err, "fetcher misconfigured; cancelling run");
                        self.cancel.cancel();
                    }
                    warn!(attempts = attempt, error = %err, "unit failed");
                    state.advance(UnitState::Failed);
                    return UnitOutcome::Failed(FailedUnit::from_fetch(&key, &err, attempt));
                }

                let delay = self.retry.delay_for_attempt(attempt - 1);
                state.advance(UnitState::Retrying { attempt });
                warn!(attempt, ?delay, error = %err, "transient fetch failure; retrying");
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        state.advance(UnitState::Failed);
                        return UnitOutcome::Failed(FailedUnit {
                            unit: key.clone(),
                            kind: "cancelled".to_string(),
                            reason: format!("run cancelled while retrying after: {err}"),
                            attempts: attempt,
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            };

            match self.classify_records(&key, records).await {
                Ok(classified) => {
                    state.advance(UnitState::Succeeded);
                    info!(
                        attempts = attempt,
                        accepted = classified.accepted.len(),
                        unchanged = classified.counts.unchanged,
                        "unit succeeded"
                    );
                    UnitOutcome::Succeeded(classified)
                }
                Err(err) => {
                    state.advance(UnitState::Failed);
                    warn!(error = %err, "fingerprint store failed; unit discarded");
                    UnitOutcome::Failed(FailedUnit::from_store(&key, &err, attempt))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn classify_records(&self, key: &str, records: Vec<RawRecord>) -> Result<Classified, StoreError> {
        let mut classified = Classified::default();
        let mut seen = HashSet::new();

        for record in records {
            if !seen.insert(record.match_id.clone()) {
                debug!(match_id = %record.match_id, "duplicate match on page; keeping the first");
                continue;
            }
            let mut digests = RecordDigests::from_record(&record);
            let stored = self.store.get(&record.match_id).await?;
            let verdict = classify(&digests, stored.as_ref(), self.sensitivity);
            classified.counts.record(verdict);
            debug!(match_id = %record.match_id, verdict = verdict.as_str(), "classified");
            if !verdict.should_persist() {
                continue;
            }
            // A preview record says nothing about history; keep what is stored.
            if digests.history_digest.is_none() {
                digests.history_digest = stored.and_then(|s| s.history_digest);
            }
            classified.pending.push((record.match_id.clone(), digests));
            classified.accepted.push(AcceptedRecord {
                unit: key.to_string(),
                verdict,
                record,
            });
        }
        Ok(classified)
    }
}
