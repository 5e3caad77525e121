//! Storage-writer boundary and per-run report files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;

use crate::coordinator::{AcceptedRecord, RunSummary};

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const ACCEPTED_FILE: &str = "accepted_records.json";
pub const BRIEF_FILE: &str = "brief.md";

/// Receives the records a run accepted together with its summary.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&self, summary: &RunSummary, accepted: &[AcceptedRecord]) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopRecordSink;

#[async_trait]
impl RecordSink for NoopRecordSink {
    async fn write(&self, _summary: &RunSummary, _accepted: &[AcceptedRecord]) -> Result<()> {
        Ok(())
    }
}

/// Writes `<reports_dir>/<run_id>/{run_summary.json, accepted_records.json, brief.md}`.
#[derive(Debug, Clone)]
pub struct JsonReportSink {
    reports_dir: PathBuf,
}

impl JsonReportSink {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    pub fn run_dir(&self, summary: &RunSummary) -> PathBuf {
        self.reports_dir.join(summary.run_id.to_string())
    }
}

#[async_trait]
impl RecordSink for JsonReportSink {
    async fn write(&self, summary: &RunSummary, accepted: &[AcceptedRecord]) -> Result<()> {
        let run_dir = self.run_dir(summary);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(run_dir.join(SUMMARY_FILE), summary_json)
            .await
            .with_context(|| format!("writing {SUMMARY_FILE}"))?;

        let accepted_json =
            serde_json::to_vec_pretty(accepted).context("serializing accepted records")?;
        fs::write(run_dir.join(ACCEPTED_FILE), accepted_json)
            .await
            .with_context(|| format!("writing {ACCEPTED_FILE}"))?;

        fs::write(run_dir.join(BRIEF_FILE), brief_markdown(summary, accepted))
            .await
            .with_context(|| format!("writing {BRIEF_FILE}"))?;
        Ok(())
    }
}

pub fn brief_markdown(summary: &RunSummary, accepted: &[AcceptedRecord]) -> String {
    let mut per_unit: BTreeMap<&str, usize> = BTreeMap::new();
    for item in accepted {
        *per_unit.entry(item.unit.as_str()).or_default() += 1;
    }

    let mut lines = vec![
        "# Odds Harvest Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Sport: {} ({}, {})", summary.sport, summary.mode, summary.sensitivity),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Units: {} planned, {} succeeded, {} failed, {} cancelled",
            summary.planned_units,
            summary.succeeded_units,
            summary.failed_units.len(),
            summary.cancelled_units.len()
        ),
        format!("- Skip efficiency: {:.1}%", summary.skip_efficiency()),
        String::new(),
        "## Change Distribution".to_string(),
        format!("- new: {}", summary.new_count),
        format!("- changed odds: {}", summary.changed_odds_count),
        format!("- changed history: {}", summary.changed_history_count),
        format!("- unchanged: {}", summary.unchanged_count),
    ];

    if !per_unit.is_empty() {
        lines.push(String::new());
        lines.push("## Accepted Per Unit".to_string());
        lines.extend(per_unit.iter().map(|(unit, n)| format!("- {unit}: {n}")));
    }
    if !summary.failed_units.is_empty() {
        lines.push(String::new());
        lines.push("## Failed Units".to_string());
        lines.extend(summary.failed_units.iter().map(|f| {
            format!("- {} ({}, {} attempts): {}", f.unit, f.kind, f.attempts, f.reason)
        }));
    }
    if !summary.warnings.is_empty() {
        lines.push(String::new());
        lines.push("## Warnings".to_string());
        lines.extend(summary.warnings.iter().map(|w| format!("- {w}")));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the `runs` most recent run directories under `reports_root`.
pub fn report_recent_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut summaries = Vec::new();
    let entries = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let summary_path = entry.path().join(SUMMARY_FILE);
        if !summary_path.exists() {
            continue;
        }
        let summary: RunSummary = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        summaries.push((summary, entry.path()));
    }
    summaries.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));

    let mut lines = vec!["# Odds Harvest Recent Runs".to_string(), String::new()];
    for (summary, dir) in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- sport: {} ({})", summary.sport, summary.mode));
        lines.push(format!(
            "- records: {} new, {} changed, {} unchanged",
            summary.new_count,
            summary.changed_count(),
            summary.unchanged_count
        ));
        lines.push(format!("- skip efficiency: {:.1}%", summary.skip_efficiency()));
        lines.push(format!(
            "- units: {} succeeded, {} failed, {} cancelled",
            summary.succeeded_units,
            summary.failed_units.len(),
            summary.cancelled_units.len()
        ));
        let brief = dir.join(BRIEF_FILE);
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::FailedUnit;
    use chrono::{TimeDelta, TimeZone, Utc};
    use ohp_core::{ChangeVerdict, HarvestMode, RawRecord, SensitivityPolicy};
    use uuid::Uuid;

    fn summary(hour: u32, new_count: usize, unchanged_count: usize) -> RunSummary {
        let started_at = Utc.with_ymd_and_hms(2026, 10, 16, hour, 0, 0).unwrap();
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at + TimeDelta::minutes(3),
            sport: "football".into(),
            mode: HarvestMode::Historic,
            sensitivity: SensitivityPolicy::Normal,
            planned_units: 3,
            new_count,
            unchanged_count,
            changed_odds_count: 1,
            changed_history_count: 0,
            succeeded_units: 2,
            cancelled_units: Vec::new(),
            failed_units: vec![FailedUnit {
                unit: "football/premier-league/2021-2022".into(),
                kind: "fetch_timeout".into(),
                reason: "timed out".into(),
                attempts: 3,
            }],
            warnings: vec!["league serie-a has no season in 2030".into()],
        }
    }

    fn accepted(unit: &str, match_id: &str) -> AcceptedRecord {
        AcceptedRecord {
            unit: unit.into(),
            verdict: ChangeVerdict::New,
            record: RawRecord {
                match_id: match_id.into(),
                home_team: "Ghana".into(),
                away_team: "Egypt".into(),
                kickoff: None,
                odds: Vec::new(),
                history: None,
            },
        }
    }

    #[tokio::test]
    async fn sink_writes_all_three_report_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonReportSink::new(dir.path());
        let summary = summary(9, 4, 6);
        let records = vec![
            accepted("football/africa-cup-of-nations/2023", "a"),
            accepted("football/africa-cup-of-nations/2023", "b"),
        ];
        sink.write(&summary, &records).await.unwrap();

        let run_dir = sink.run_dir(&summary);
        let stored: RunSummary =
            serde_json::from_slice(&std::fs::read(run_dir.join(SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(stored, summary);
        let stored_records: Vec<AcceptedRecord> =
            serde_json::from_slice(&std::fs::read(run_dir.join(ACCEPTED_FILE)).unwrap()).unwrap();
        assert_eq!(stored_records.len(), 2);

        let brief = std::fs::read_to_string(run_dir.join(BRIEF_FILE)).unwrap();
        assert!(brief.contains("Skip efficiency: 54.5%"));
        assert!(brief.contains("football/africa-cup-of-nations/2023: 2"));
        assert!(brief.contains("fetch_timeout"));
        assert!(brief.contains("## Warnings"));
    }

    #[tokio::test]
    async fn recent_report_lists_newest_runs_first() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonReportSink::new(dir.path());
        let older = summary(6, 1, 0);
        let newer = summary(18, 0, 5);
        sink.write(&older, &[]).await.unwrap();
        sink.write(&newer, &[]).await.unwrap();
        std::fs::create_dir_all(dir.path().join("not-a-run")).unwrap();

        let markdown = report_recent_markdown(1, dir.path()).unwrap();
        assert!(markdown.contains(&newer.run_id.to_string()));
        assert!(!markdown.contains(&older.run_id.to_string()));

        let both = report_recent_markdown(5, dir.path()).unwrap();
        let newer_at = both.find(&newer.run_id.to_string()).unwrap();
        let older_at = both.find(&older.run_id.to_string()).unwrap();
        assert!(newer_at < older_at);
    }
}
