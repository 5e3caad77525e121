use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use ohp_adapters::RetryPolicy;
use ohp_core::HarvestMode;
use ohp_planner::{
    fixture_clients, report_recent_markdown, HarvestCoordinator, HarvestPipeline, JsonReportSink,
    ManualClock, RunProfile,
};
use ohp_storage::FileFingerprintStore;
use tokio_util::sync::CancellationToken;

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
}

fn pipeline(state: &Path, reports: &Path) -> HarvestPipeline {
    let (discovery, fetcher) = fixture_clients(&fixtures_dir(), "football").unwrap();
    let clock = Arc::new(ManualClock::new(today().and_hms_opt(7, 0, 0).unwrap().and_utc()));
    let coordinator = HarvestCoordinator::new(
        discovery,
        fetcher,
        Arc::new(FileFingerprintStore::new(state)),
        clock,
    )
    .with_retry_policy(RetryPolicy::no_delay(3));
    HarvestPipeline::new(coordinator).with_sink(Box::new(JsonReportSink::new(reports)))
}

#[tokio::test]
async fn africa_cup_backfill_is_incremental_across_runs() {
    let state = tempfile::tempdir().unwrap();
    let reports = tempfile::tempdir().unwrap();
    let pipeline = pipeline(state.path(), reports.path());
    let request = RunProfile {
        sport: "football".into(),
        mode: Some(HarvestMode::Historic),
        leagues: vec!["africa-cup-of-nations".into()],
        from: Some("2000".into()),
        to: Some("2025".into()),
        ..RunProfile::default()
    }
    .validate(today())
    .unwrap();

    let first = pipeline.run_once(&request, CancellationToken::new()).await.unwrap();
    assert_eq!(first.planned_units, 10);
    assert_eq!(first.succeeded_units, 10);
    assert!(first.failed_units.is_empty());
    assert_eq!(first.new_count, 29);

    let second = pipeline.run_once(&request, CancellationToken::new()).await.unwrap();
    assert_eq!(second.new_count, 0);
    assert_eq!(second.changed_count(), 0);
    assert_eq!(second.unchanged_count, 29);

    let markdown = report_recent_markdown(2, reports.path()).unwrap();
    assert!(markdown.contains(&first.run_id.to_string()));
    assert!(markdown.contains(&second.run_id.to_string()));
}

#[tokio::test]
async fn uncaptured_seasons_fail_without_stopping_the_league() {
    let state = tempfile::tempdir().unwrap();
    let reports = tempfile::tempdir().unwrap();
    let pipeline = pipeline(state.path(), reports.path());
    let request = RunProfile {
        sport: "football".into(),
        mode: Some(HarvestMode::Historic),
        leagues: vec!["premier-league".into()],
        from: Some("2019-2020".into()),
        to: Some("2022-2023".into()),
        markets: vec!["1x2".into()],
        ..RunProfile::default()
    }
    .validate(today())
    .unwrap();

    let summary = pipeline.run_once(&request, CancellationToken::new()).await.unwrap();
    assert_eq!(summary.planned_units, 4);
    assert_eq!(summary.succeeded_units, 2);
    assert_eq!(summary.failed_units.len(), 2);
    assert!(summary.failed_units.iter().all(|f| f.kind == "not_found" && f.attempts == 1));
    assert_eq!(summary.new_count, 8);
}
