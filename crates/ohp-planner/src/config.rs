//! Environment configuration and validated run options.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use ohp_adapters::{FetchOptions, RetryPolicy};
use ohp_core::{DateSpec, HarvestMode, InvalidRange, ResolvedRange, SensitivityPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::range;

pub const DEFAULT_CONCURRENCY: usize = 3;

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub fixtures_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub fingerprint_dir: PathBuf,
    /// When set, fingerprints live in Postgres instead of `fingerprint_dir`.
    pub database_url: Option<String>,
    pub retry: RetryPolicy,
    pub discovery_ttl_secs: u64,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            fixtures_dir: std::env::var("OHP_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures")),
            reports_dir: std::env::var("OHP_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            fingerprint_dir: std::env::var("OHP_FINGERPRINT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state/fingerprints")),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            retry: RetryPolicy {
                max_attempts: env_parse("OHP_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
                base_delay: env_parse("OHP_RETRY_BASE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.base_delay),
                max_delay: env_parse("OHP_RETRY_MAX_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_delay),
            },
            discovery_ttl_secs: env_parse("OHP_DISCOVERY_TTL_SECS").unwrap_or(1800),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    InvalidRange(#[from] InvalidRange),
    #[error("sport must not be empty")]
    MissingSport,
    #[error("harvest mode is required (upcoming or historic)")]
    MissingMode,
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("max_pages must be at least 1")]
    InvalidMaxPages,
    #[error("match link {0:?} is not an http(s) URL")]
    InvalidMatchLink(String),
    #[error("'all' cannot be combined with explicit {kind}: {values:?}")]
    MixedSelector { kind: &'static str, values: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeagueSelector {
    All,
    Only(BTreeSet<String>),
}

impl LeagueSelector {
    /// Empty input or a lone `all` selects every league.
    pub fn parse(values: &[String]) -> Result<Self, ConfigError> {
        let values = normalize_labels(values);
        if values.is_empty() || values == ["all"] {
            return Ok(Self::All);
        }
        if values.iter().any(|v| v == "all") {
            return Err(ConfigError::MixedSelector {
                kind: "leagues",
                values,
            });
        }
        Ok(Self::Only(values.into_iter().collect()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketSelector {
    /// Every market discovery reports for the sport.
    All,
    /// Whatever the page shows by default.
    Auto,
    Only(BTreeSet<String>),
}

impl MarketSelector {
    pub fn parse(values: &[String]) -> Result<Self, ConfigError> {
        let values = normalize_labels(values);
        match values.as_slice() {
            [] => return Ok(Self::Auto),
            [only] if only == "auto" => return Ok(Self::Auto),
            [only] if only == "all" => return Ok(Self::All),
            _ => {}
        }
        if values.iter().any(|v| v == "all" || v == "auto") {
            return Err(ConfigError::MixedSelector {
                kind: "markets",
                values,
            });
        }
        Ok(Self::Only(values.into_iter().collect()))
    }
}

fn normalize_labels(values: &[String]) -> Vec<String> {
    let mut labels: Vec<String> = values
        .iter()
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    labels.sort();
    labels.dedup();
    labels
}

/// Raw run options as written in a YAML profile or assembled from CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunProfile {
    pub sport: String,
    pub mode: Option<HarvestMode>,
    pub leagues: Vec<String>,
    pub markets: Vec<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub concurrency: Option<usize>,
    pub sensitivity: Option<SensitivityPolicy>,
    pub match_links: Vec<String>,
    pub preview: bool,
    pub max_pages: Option<u32>,
    pub target_bookmaker: Option<String>,
}

impl RunProfile {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("parsing run profile")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading run profile {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    /// Fields set on `overrides` replace the ones loaded from the profile.
    pub fn overlay(mut self, overrides: RunProfile) -> Self {
        if !overrides.sport.is_empty() {
            self.sport = overrides.sport;
        }
        self.mode = overrides.mode.or(self.mode);
        if !overrides.leagues.is_empty() {
            self.leagues = overrides.leagues;
        }
        if !overrides.markets.is_empty() {
            self.markets = overrides.markets;
        }
        self.from = overrides.from.or(self.from);
        self.to = overrides.to.or(self.to);
        self.concurrency = overrides.concurrency.or(self.concurrency);
        self.sensitivity = overrides.sensitivity.or(self.sensitivity);
        if !overrides.match_links.is_empty() {
            self.match_links = overrides.match_links;
        }
        self.preview |= overrides.preview;
        self.max_pages = overrides.max_pages.or(self.max_pages);
        self.target_bookmaker = overrides.target_bookmaker.or(self.target_bookmaker);
        self
    }

    pub fn validate(&self, today: NaiveDate) -> Result<RunRequest, ConfigError> {
        let sport = self.sport.trim().to_lowercase();
        if sport.is_empty() {
            return Err(ConfigError::MissingSport);
        }
        let mode = self.mode.ok_or(ConfigError::MissingMode)?;
        let concurrency = self.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.max_pages == Some(0) {
            return Err(ConfigError::InvalidMaxPages);
        }

        let from = parse_spec(self.from.as_deref())?;
        let to = parse_spec(self.to.as_deref())?;
        let range = range::resolve(from, to, mode, today)?;

        let mut match_links = Vec::new();
        for link in &self.match_links {
            let link = link.trim();
            if !(link.starts_with("https://") || link.starts_with("http://")) {
                return Err(ConfigError::InvalidMatchLink(link.to_string()));
            }
            if !match_links.iter().any(|seen: &String| seen == link) {
                match_links.push(link.to_string());
            }
        }

        Ok(RunRequest {
            sport,
            mode,
            leagues: LeagueSelector::parse(&self.leagues)?,
            markets: MarketSelector::parse(&self.markets)?,
            from,
            to,
            range,
            concurrency,
            sensitivity: self.sensitivity.unwrap_or_default(),
            match_links,
            include_history: !self.preview,
            max_pages: self.max_pages,
            target_bookmaker: self
                .target_bookmaker
                .as_deref()
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string),
        })
    }
}

fn parse_spec(token: Option<&str>) -> Result<Option<DateSpec>, InvalidRange> {
    token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::parse::<DateSpec>)
        .transpose()
}

/// Validated, typed options for one harvest invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRequest {
    pub sport: String,
    pub mode: HarvestMode,
    pub leagues: LeagueSelector,
    pub markets: MarketSelector,
    pub from: Option<DateSpec>,
    pub to: Option<DateSpec>,
    pub range: ResolvedRange,
    pub concurrency: usize,
    pub sensitivity: SensitivityPolicy,
    /// Non-empty means direct match-link mode; range and leagues are ignored.
    pub match_links: Vec<String>,
    pub include_history: bool,
    pub max_pages: Option<u32>,
    pub target_bookmaker: Option<String>,
}

impl RunRequest {
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            include_history: self.include_history,
            max_pages: self.max_pages,
            target_bookmaker: self.target_bookmaker.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn profile_yaml_validates_into_request() {
        let profile = RunProfile::from_yaml_str(
            r#"
sport: Football
mode: historic
leagues: [africa-cup-of-nations]
markets: ["1X2", "over/under 2.5"]
from: "2000"
to: now
concurrency: 5
sensitivity: aggressive
"#,
        )
        .unwrap();
        let request = profile.validate(today()).unwrap();
        assert_eq!(request.sport, "football");
        assert_eq!(request.mode, HarvestMode::Historic);
        assert_eq!(
            request.leagues,
            LeagueSelector::Only(["africa-cup-of-nations".to_string()].into_iter().collect())
        );
        assert_eq!(
            request.markets,
            MarketSelector::Only(strings(&["1x2", "over/under 2.5"]).into_iter().collect())
        );
        assert_eq!(request.concurrency, 5);
        assert_eq!(request.sensitivity, SensitivityPolicy::Aggressive);
        assert_eq!(request.range.seasons().count(), 27);
        assert!(request.include_history);
    }

    #[test]
    fn defaults_apply_when_fields_are_omitted() {
        let profile = RunProfile {
            sport: "football".into(),
            mode: Some(HarvestMode::Upcoming),
            ..RunProfile::default()
        };
        let request = profile.validate(today()).unwrap();
        assert_eq!(request.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(request.sensitivity, SensitivityPolicy::Normal);
        assert_eq!(request.leagues, LeagueSelector::All);
        assert_eq!(request.markets, MarketSelector::Auto);
        assert!(request.range.unbounded_future());
    }

    #[test]
    fn invalid_options_fail_before_any_work() {
        let base = RunProfile {
            sport: "football".into(),
            mode: Some(HarvestMode::Upcoming),
            ..RunProfile::default()
        };

        let zero = RunProfile {
            concurrency: Some(0),
            ..base.clone()
        };
        assert!(matches!(zero.validate(today()), Err(ConfigError::InvalidConcurrency)));

        let bad_range = RunProfile {
            from: Some("2023-2024".into()),
            ..base.clone()
        };
        assert!(matches!(
            bad_range.validate(today()),
            Err(ConfigError::InvalidRange(InvalidRange::IncompatibleGranularity { .. }))
        ));

        let no_mode = RunProfile {
            mode: None,
            ..base.clone()
        };
        assert!(matches!(no_mode.validate(today()), Err(ConfigError::MissingMode)));

        let bad_link = RunProfile {
            match_links: strings(&["ftp://example.test/match"]),
            ..base
        };
        assert!(matches!(bad_link.validate(today()), Err(ConfigError::InvalidMatchLink(_))));
    }

    #[test]
    fn selectors_parse_keywords_and_lists() {
        assert_eq!(LeagueSelector::parse(&strings(&["ALL"])).unwrap(), LeagueSelector::All);
        assert_eq!(MarketSelector::parse(&strings(&["all"])).unwrap(), MarketSelector::All);
        assert_eq!(MarketSelector::parse(&[]).unwrap(), MarketSelector::Auto);
        assert_eq!(
            MarketSelector::parse(&strings(&["1x2,btts", "1X2"])).unwrap(),
            MarketSelector::Only(strings(&["1x2", "btts"]).into_iter().collect())
        );
        assert!(matches!(
            LeagueSelector::parse(&strings(&["all", "serie-a"])),
            Err(ConfigError::MixedSelector { .. })
        ));
    }

    #[test]
    fn overlay_prefers_explicit_flags() {
        let file = RunProfile {
            sport: "football".into(),
            mode: Some(HarvestMode::Historic),
            leagues: strings(&["premier-league"]),
            concurrency: Some(2),
            ..RunProfile::default()
        };
        let flags = RunProfile {
            concurrency: Some(6),
            preview: true,
            ..RunProfile::default()
        };
        let merged = file.overlay(flags);
        assert_eq!(merged.sport, "football");
        assert_eq!(merged.leagues, strings(&["premier-league"]));
        assert_eq!(merged.concurrency, Some(6));
        assert!(merged.preview);
    }

    #[test]
    fn preview_and_bookmaker_flow_into_fetch_options() {
        let profile = RunProfile {
            sport: "football".into(),
            mode: Some(HarvestMode::Upcoming),
            preview: true,
            max_pages: Some(2),
            target_bookmaker: Some(" Pinnacle ".into()),
            ..RunProfile::default()
        };
        let options = profile.validate(today()).unwrap().fetch_options();
        assert!(!options.include_history);
        assert_eq!(options.max_pages, Some(2));
        assert_eq!(options.target_bookmaker.as_deref(), Some("Pinnacle"));
    }
}
