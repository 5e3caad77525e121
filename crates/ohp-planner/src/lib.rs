//! Harvest planning and orchestration: range resolution, season intersection,
//! change detection and the bounded fetch coordinator.

pub mod cache;
pub mod change;
pub mod config;
pub mod coordinator;
pub mod intersect;
pub mod range;
pub mod report;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use ohp_adapters::{
    fixture_site_path, load_fixture_site, DiscoveryClient, FixtureDiscoveryClient, FixturePageFetcher,
    PageFetcher,
};
use ohp_storage::{FileFingerprintStore, FingerprintStore, PgFingerprintStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use cache::{Clock, DiscoveryCache, ManualClock, SystemClock};
pub use config::{
    ConfigError, HarvestConfig, LeagueSelector, MarketSelector, RunProfile, RunRequest,
    DEFAULT_CONCURRENCY,
};
pub use coordinator::{
    AcceptedRecord, FailedUnit, HarvestCoordinator, HarvestOutcome, PendingFingerprint, RunSummary,
    UnitState, VerdictCounts,
};
pub use report::{report_recent_markdown, JsonReportSink, NoopRecordSink, RecordSink};

pub const CRATE_NAME: &str = "ohp-planner";

/// A coordinator plus the sink that receives what it accepted.
pub struct HarvestPipeline {
    coordinator: HarvestCoordinator,
    sink: Box<dyn RecordSink>,
}

impl HarvestPipeline {
    pub fn new(coordinator: HarvestCoordinator) -> Self {
        Self {
            coordinator,
            sink: Box::<NoopRecordSink>::default(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn RecordSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Fingerprints are committed only after the sink has accepted the records.
    pub async fn run_once(&self, request: &RunRequest, cancel: CancellationToken) -> Result<RunSummary> {
        let outcome = self.coordinator.run(request, cancel).await;
        self.sink
            .write(&outcome.summary, &outcome.accepted)
            .await
            .context("handing accepted records to the sink")?;
        self.coordinator
            .commit_fingerprints(&outcome)
            .await
            .context("committing fingerprints")?;
        Ok(outcome.summary)
    }
}

/// Postgres when `DATABASE_URL` is set, the on-disk store otherwise.
pub async fn open_fingerprint_store(config: &HarvestConfig) -> Result<Arc<dyn FingerprintStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgFingerprintStore::connect(url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(FileFingerprintStore::new(config.fingerprint_dir.clone()))),
    }
}

/// Fixture-backed site clients for `sport`, read from `fixtures_dir/<sport>/site.json`.
pub fn fixture_clients(
    fixtures_dir: &Path,
    sport: &str,
) -> Result<(Arc<dyn DiscoveryClient>, Arc<dyn PageFetcher>)> {
    let path = fixture_site_path(fixtures_dir, sport);
    let site = Arc::new(
        load_fixture_site(&path).with_context(|| format!("loading site fixture for {sport}"))?,
    );
    Ok((
        Arc::new(FixtureDiscoveryClient::new(site.clone())),
        Arc::new(FixturePageFetcher::new(site)),
    ))
}

/// Validates `profile`, wires the env-configured collaborators and runs one harvest.
///
/// Ctrl-C cancels the run: units not yet started are reported as cancelled.
pub async fn run_harvest_from_env(profile: RunProfile) -> Result<RunSummary> {
    let config = HarvestConfig::from_env();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let request = profile.validate(clock.now().date_naive())?;

    let (discovery, fetcher) = fixture_clients(&config.fixtures_dir, &request.sport)?;
    let store = open_fingerprint_store(&config).await?;
    info!(backend = store.backend(), "fingerprint store ready");

    let coordinator = HarvestCoordinator::new(discovery, fetcher, store, clock)
        .with_retry_policy(config.retry)
        .with_discovery_ttl(TimeDelta::seconds(config.discovery_ttl_secs as i64));
    let pipeline = HarvestPipeline::new(coordinator)
        .with_sink(Box::new(JsonReportSink::new(config.reports_dir.clone())));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling harvest");
            on_signal.cancel();
        }
    });
    let summary = pipeline.run_once(&request, cancel).await;
    watcher.abort();
    summary
}
