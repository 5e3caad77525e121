//! Site boundary contracts (discovery + page fetching) and fixture-first implementations.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ohp_core::{FetchTarget, FetchUnit, RawRecord, Season};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ohp-adapters";

/// Result pages on the source site hold this many matches.
pub const RESULTS_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Per-unit retry bound with exponential, capped backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the attempt following `attempt_index` (zero-based).
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Discovery could not list what the site offers for `scope` (a league or a sport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("discovery failed for {scope}: {reason}")]
pub struct DiscoveryFailure {
    pub scope: String,
    pub reason: String,
}

impl DiscoveryFailure {
    pub fn new(scope: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("timed out fetching {0}")]
    Timeout(String),
    #[error("connection reset while fetching {0}")]
    ConnectionReset(String),
    #[error("blocked by the site while fetching {0}")]
    Blocked(String),
    #[error("page structure changed at {target}: {detail}")]
    PageStructureChanged { target: String, detail: String },
    #[error("no page exists for {0}")]
    NotFound(String),
    #[error("fetcher misconfigured: {0}")]
    Misconfigured(String),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Timeout(_) | Self::ConnectionReset(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }

    /// Configuration problems poison every remaining unit, so the run stops taking new work.
    pub fn cancels_run(&self) -> bool {
        matches!(self, Self::Misconfigured(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "fetch_timeout",
            Self::ConnectionReset(_) => "connection_reset",
            Self::Blocked(_) => "fetch_blocked",
            Self::PageStructureChanged { .. } => "page_structure_changed",
            Self::NotFound(_) => "not_found",
            Self::Misconfigured(_) => "misconfigured",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// `false` is preview mode: records come back without odds history.
    pub include_history: bool,
    pub max_pages: Option<u32>,
    pub target_bookmaker: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            include_history: true,
            max_pages: None,
            target_bookmaker: None,
        }
    }
}

#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn list_seasons(&self, sport: &str, league: &str) -> Result<BTreeSet<Season>, DiscoveryFailure>;

    async fn list_markets(&self, sport: &str) -> Result<BTreeSet<String>, DiscoveryFailure>;

    async fn list_leagues(&self, sport: &str) -> Result<BTreeSet<String>, DiscoveryFailure>;
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_unit(
        &self,
        unit: &FetchUnit,
        options: &FetchOptions,
    ) -> Result<Vec<RawRecord>, FetchError>;
}

/// Captured snapshot of what the site exposed for one sport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSite {
    pub sport: String,
    pub captured_from_url: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub markets: BTreeSet<String>,
    #[serde(default)]
    pub leagues: BTreeMap<String, FixtureLeague>,
    #[serde(default)]
    pub upcoming: Vec<FixtureUpcomingDay>,
    #[serde(default)]
    pub matches: BTreeMap<String, RawRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureLeague {
    /// Seasons listed in the league archive, whether or not a page was captured.
    pub seasons: BTreeSet<Season>,
    #[serde(default)]
    pub results: BTreeMap<Season, Vec<RawRecord>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureUpcomingDay {
    pub date: NaiveDate,
    pub league: String,
    #[serde(default)]
    pub records: Vec<RawRecord>,
}

pub fn fixture_site_path(fixtures_root: &Path, sport: &str) -> PathBuf {
    fixtures_root.join(sport).join("site.json")
}

pub fn load_fixture_site(path: impl AsRef<Path>) -> Result<FixtureSite> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn apply_fetch_options(mut record: RawRecord, unit: &FetchUnit, options: &FetchOptions) -> RawRecord {
    if !unit.markets.is_empty() {
        record.odds.retain(|entry| {
            unit.markets
                .iter()
                .any(|market| market.eq_ignore_ascii_case(&entry.market))
        });
    }
    if let Some(bookmaker) = &options.target_bookmaker {
        record
            .odds
            .retain(|entry| entry.bookmaker.eq_ignore_ascii_case(bookmaker));
        if let Some(history) = record.history.as_mut() {
            history.retain(|point| point.bookmaker.eq_ignore_ascii_case(bookmaker));
        }
    }
    if !options.include_history {
        record.history = None;
    }
    record
}

#[derive(Debug, Clone)]
pub struct FixtureDiscoveryClient {
    site: Arc<FixtureSite>,
}

impl FixtureDiscoveryClient {
    pub fn new(site: Arc<FixtureSite>) -> Self {
        Self { site }
    }

    fn check_sport(&self, sport: &str) -> Result<(), DiscoveryFailure> {
        if self.site.sport.eq_ignore_ascii_case(sport) {
            Ok(())
        } else {
            Err(DiscoveryFailure::new(
                sport,
                format!("fixture captures {} only", self.site.sport),
            ))
        }
    }
}

#[async_trait]
impl DiscoveryClient for FixtureDiscoveryClient {
    async fn list_seasons(&self, sport: &str, league: &str) -> Result<BTreeSet<Season>, DiscoveryFailure> {
        self.check_sport(sport)?;
        self.site
            .leagues
            .get(league)
            .map(|l| l.seasons.clone())
            .ok_or_else(|| DiscoveryFailure::new(league, "league archive page not captured"))
    }

    async fn list_markets(&self, sport: &str) -> Result<BTreeSet<String>, DiscoveryFailure> {
        self.check_sport(sport)?;
        Ok(self.site.markets.clone())
    }

    async fn list_leagues(&self, sport: &str) -> Result<BTreeSet<String>, DiscoveryFailure> {
        self.check_sport(sport)?;
        Ok(self.site.leagues.keys().cloned().collect())
    }
}

#[derive(Debug, Clone)]
pub struct FixturePageFetcher {
    site: Arc<FixtureSite>,
}

impl FixturePageFetcher {
    pub fn new(site: Arc<FixtureSite>) -> Self {
        Self { site }
    }
}

#[async_trait]
impl PageFetcher for FixturePageFetcher {
    async fn fetch_unit(
        &self,
        unit: &FetchUnit,
        options: &FetchOptions,
    ) -> Result<Vec<RawRecord>, FetchError> {
        if !self.site.sport.eq_ignore_ascii_case(&unit.sport) {
            return Err(FetchError::NotFound(unit.key()));
        }

        let records: Vec<RawRecord> = match &unit.target {
            FetchTarget::Season(season) => {
                let league = unit
                    .league
                    .as_deref()
                    .and_then(|slug| self.site.leagues.get(slug))
                    .ok_or_else(|| FetchError::NotFound(unit.key()))?;
                let mut records = league
                    .results
                    .get(season)
                    .cloned()
                    .ok_or_else(|| FetchError::NotFound(unit.key()))?;
                if let Some(pages) = options.max_pages {
                    records.truncate(pages as usize * RESULTS_PAGE_SIZE);
                }
                records
            }
            FetchTarget::Date(date) => self
                .site
                .upcoming
                .iter()
                .filter(|day| day.date == *date)
                .filter(|day| unit.league.as_deref().map_or(true, |l| l == day.league))
                .flat_map(|day| day.records.iter().cloned())
                .collect(),
            FetchTarget::Match(link) => {
                let record = self
                    .site
                    .matches
                    .get(link)
                    .cloned()
                    .ok_or_else(|| FetchError::NotFound(link.clone()))?;
                vec![record]
            }
        };

        Ok(records
            .into_iter()
            .map(|record| apply_fetch_options(record, unit, options))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE_JSON: &str = r#"{
        "sport": "football",
        "captured_from_url": "https://www.oddsportal.com/football/",
        "captured_at": "2025-06-01T12:00:00Z",
        "markets": ["1x2", "btts"],
        "leagues": {
            "premier-league": {
                "seasons": ["2022-2023", "2023-2024"],
                "results": {
                    "2023-2024": [
                        {
                            "match_id": "pl-1",
                            "home_team": "Arsenal",
                            "away_team": "Chelsea",
                            "odds": [
                                {"bookmaker": "bet365", "market": "1x2", "prices": [2.1, 3.4, 3.2]},
                                {"bookmaker": "pinnacle", "market": "btts", "prices": [1.8, 2.0]}
                            ],
                            "history": [
                                {"bookmaker": "bet365", "market": "1x2", "outcome": 0,
                                 "recorded_at": "2024-01-01T10:00:00Z", "price": 2.2},
                                {"bookmaker": "pinnacle", "market": "btts", "outcome": 1,
                                 "recorded_at": "2024-01-01T10:00:00Z", "price": 2.1}
                            ]
                        }
                    ]
                }
            }
        },
        "upcoming": [
            {"date": "2025-06-02", "league": "premier-league", "records": [
                {"match_id": "up-1", "home_team": "Spurs", "away_team": "Everton", "odds": []}
            ]},
            {"date": "2025-06-02", "league": "la-liga", "records": [
                {"match_id": "up-2", "home_team": "Betis", "away_team": "Sevilla", "odds": []}
            ]}
        ]
    }"#;

    fn site() -> Arc<FixtureSite> {
        Arc::new(serde_json::from_str(SITE_JSON).expect("fixture json"))
    }

    fn season_unit(season: Season, markets: &[&str]) -> FetchUnit {
        FetchUnit {
            sport: "football".into(),
            league: Some("premier-league".into()),
            target: FetchTarget::Season(season),
            markets: markets.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn retry_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn only_network_glitches_are_retryable() {
        assert_eq!(FetchError::Timeout("x".into()).disposition(), RetryDisposition::Retryable);
        assert_eq!(
            FetchError::ConnectionReset("x".into()).disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(FetchError::Blocked("x".into()).disposition(), RetryDisposition::NonRetryable);
        assert_eq!(FetchError::NotFound("x".into()).disposition(), RetryDisposition::NonRetryable);
        assert!(FetchError::Misconfigured("x".into()).cancels_run());
        assert!(!FetchError::Timeout("x".into()).cancels_run());
    }

    #[tokio::test]
    async fn discovery_lists_archive_seasons_and_rejects_unknown_league() {
        let client = FixtureDiscoveryClient::new(site());
        let seasons = client.list_seasons("football", "premier-league").await.unwrap();
        assert_eq!(
            seasons.into_iter().collect::<Vec<_>>(),
            vec![Season::split(2022), Season::split(2023)]
        );
        let err = client.list_seasons("football", "serie-a").await.unwrap_err();
        assert_eq!(err.scope, "serie-a");
        assert!(client.list_markets("tennis").await.is_err());
    }

    #[tokio::test]
    async fn listed_season_without_capture_is_not_found() {
        let fetcher = FixturePageFetcher::new(site());
        let err = fetcher
            .fetch_unit(&season_unit(Season::split(2022), &[]), &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[tokio::test]
    async fn fetch_options_filter_markets_bookmaker_and_history() {
        let fetcher = FixturePageFetcher::new(site());
        let unit = season_unit(Season::split(2023), &["1X2"]);
        let records = fetcher.fetch_unit(&unit, &FetchOptions::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].odds.len(), 1);
        assert_eq!(records[0].odds[0].market, "1x2");
        assert!(records[0].history.is_some());

        let preview = FetchOptions {
            include_history: false,
            target_bookmaker: Some("Pinnacle".into()),
            ..FetchOptions::default()
        };
        let records = fetcher
            .fetch_unit(&season_unit(Season::split(2023), &[]), &preview)
            .await
            .unwrap();
        assert_eq!(records[0].odds.len(), 1);
        assert_eq!(records[0].odds[0].bookmaker, "pinnacle");
        assert!(records[0].history.is_none());
    }

    #[tokio::test]
    async fn upcoming_day_filters_by_league_when_given() {
        let fetcher = FixturePageFetcher::new(site());
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let mut unit = FetchUnit {
            sport: "football".into(),
            league: None,
            target: FetchTarget::Date(date),
            markets: BTreeSet::new(),
        };
        let all = fetcher.fetch_unit(&unit, &FetchOptions::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        unit.league = Some("la-liga".into());
        let one = fetcher.fetch_unit(&unit, &FetchOptions::default()).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].match_id, "up-2");
    }
}
