//! Core domain model for the odds harvest planner.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ohp-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HarvestMode {
    Upcoming,
    Historic,
}

impl fmt::Display for HarvestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upcoming => f.write_str("upcoming"),
            Self::Historic => f.write_str("historic"),
        }
    }
}

impl FromStr for HarvestMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "upcoming" | "upcoming-matches" => Ok(Self::Upcoming),
            "historic" | "historical" => Ok(Self::Historic),
            other => Err(format!("unknown harvest mode '{other}' (expected upcoming or historic)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Day,
    Month,
    Year,
    SeasonRange,
    Now,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Day => "day",
            Self::Month => "month",
            Self::Year => "year",
            Self::SeasonRange => "season-range",
            Self::Now => "now",
        };
        f.write_str(name)
    }
}

/// Raised for date/season input that cannot become a harvest range. Always fatal for a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRange {
    #[error("invalid date token '{0}': expected YYYYMMDD, YYYYMM, YYYY, YYYY-YYYY or 'now'")]
    MalformedToken(String),
    #[error("invalid season range '{0}': the second year must be exactly one after the first")]
    InvalidSeason(String),
    #[error("{granularity} specs cannot be used for {mode} harvests")]
    IncompatibleGranularity {
        granularity: Granularity,
        mode: HarvestMode,
    },
    #[error("range end {to} is before range start {from}")]
    Reversed { from: String, to: String },
}

/// User-facing range endpoint in one of the supported granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DateSpec {
    Day(NaiveDate),
    Month { year: i32, month: u32 },
    Year(i32),
    SeasonRange { start: i32, end: i32 },
    Now,
}

impl DateSpec {
    pub fn granularity(&self) -> Granularity {
        match self {
            Self::Day(_) => Granularity::Day,
            Self::Month { .. } => Granularity::Month,
            Self::Year(_) => Granularity::Year,
            Self::SeasonRange { .. } => Granularity::SeasonRange,
            Self::Now => Granularity::Now,
        }
    }

    pub fn is_range_type(&self) -> bool {
        matches!(self, Self::SeasonRange { .. })
    }
}

fn all_digits(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}

fn parse_year(text: &str, original: &str) -> Result<i32, InvalidRange> {
    text.parse::<i32>()
        .map_err(|_| InvalidRange::MalformedToken(original.to_string()))
}

impl FromStr for DateSpec {
    type Err = InvalidRange;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let token = input.trim().to_ascii_lowercase();
        let malformed = || InvalidRange::MalformedToken(input.trim().to_string());

        if token == "now" {
            return Ok(Self::Now);
        }

        if let Some((left, right)) = token.split_once('-') {
            if left.len() != 4 || right.len() != 4 || !all_digits(left) || !all_digits(right) {
                return Err(malformed());
            }
            let start = parse_year(left, &token)?;
            let end = parse_year(right, &token)?;
            if end != start + 1 {
                return Err(InvalidRange::InvalidSeason(token));
            }
            return Ok(Self::SeasonRange { start, end });
        }

        if !all_digits(&token) {
            return Err(malformed());
        }

        match token.len() {
            8 => NaiveDate::parse_from_str(&token, "%Y%m%d")
                .map(Self::Day)
                .map_err(|_| malformed()),
            6 => {
                let year = parse_year(&token[..4], &token)?;
                let month = token[4..].parse::<u32>().map_err(|_| malformed())?;
                if !(1..=12).contains(&month) {
                    return Err(malformed());
                }
                Ok(Self::Month { year, month })
            }
            4 => Ok(Self::Year(parse_year(&token, &token)?)),
            _ => Err(malformed()),
        }
    }
}

impl fmt::Display for DateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day(date) => write!(f, "{}", date.format("%Y%m%d")),
            Self::Month { year, month } => write!(f, "{year:04}{month:02}"),
            Self::Year(year) => write!(f, "{year:04}"),
            Self::SeasonRange { start, end } => write!(f, "{start:04}-{end:04}"),
            Self::Now => f.write_str("now"),
        }
    }
}

impl TryFrom<String> for DateSpec {
    type Error = InvalidRange;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DateSpec> for String {
    fn from(value: DateSpec) -> Self {
        value.to_string()
    }
}

/// A competition season: one calendar year or a split `start-(start+1)` period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Season {
    Single(i32),
    Split { start: i32, end: i32 },
}

impl Season {
    pub fn split(start: i32) -> Self {
        Self::Split {
            start,
            end: start + 1,
        }
    }

    pub fn start_year(&self) -> i32 {
        match self {
            Self::Single(year) => *year,
            Self::Split { start, .. } => *start,
        }
    }

    pub fn end_year(&self) -> i32 {
        match self {
            Self::Single(year) => *year,
            Self::Split { end, .. } => *end,
        }
    }
}

impl Ord for Season {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.start_year(), self.end_year()).cmp(&(other.start_year(), other.end_year()))
    }
}

impl PartialOrd for Season {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(year) => write!(f, "{year:04}"),
            Self::Split { start, end } => write!(f, "{start:04}-{end:04}"),
        }
    }
}

impl FromStr for Season {
    type Err = InvalidRange;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        // Sites write split seasons with either separator.
        let normalized = input.trim().replace('/', "-");
        match normalized.parse::<DateSpec>()? {
            DateSpec::Year(year) => Ok(Self::Single(year)),
            DateSpec::SeasonRange { start, end } => Ok(Self::Split { start, end }),
            _ => Err(InvalidRange::MalformedToken(input.trim().to_string())),
        }
    }
}

impl TryFrom<String> for Season {
    type Error = InvalidRange;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Season> for String {
    fn from(value: Season) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeUnit {
    Date(NaiveDate),
    Season(Season),
}

impl RangeUnit {
    fn anchor_year(&self) -> i32 {
        match self {
            Self::Date(date) => date.year(),
            Self::Season(season) => season.start_year(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Openness {
    Bounded,
    OpenPast,
    OpenFuture,
}

/// Ordered, deduplicated discovery units. At most one side can be unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRange {
    units: Vec<RangeUnit>,
    openness: Openness,
}

impl ResolvedRange {
    pub fn bounded(units: impl IntoIterator<Item = RangeUnit>) -> Self {
        Self::build(units, Openness::Bounded)
    }

    pub fn open_past(units: impl IntoIterator<Item = RangeUnit>) -> Self {
        Self::build(units, Openness::OpenPast)
    }

    pub fn open_future(units: impl IntoIterator<Item = RangeUnit>) -> Self {
        Self::build(units, Openness::OpenFuture)
    }

    fn build(units: impl IntoIterator<Item = RangeUnit>, openness: Openness) -> Self {
        let units: BTreeSet<RangeUnit> = units.into_iter().collect();
        Self {
            units: units.into_iter().collect(),
            openness,
        }
    }

    pub fn units(&self) -> &[RangeUnit] {
        &self.units
    }

    pub fn unbounded_past(&self) -> bool {
        self.openness == Openness::OpenPast
    }

    pub fn unbounded_future(&self) -> bool {
        self.openness == Openness::OpenFuture
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn first(&self) -> Option<&RangeUnit> {
        self.units.first()
    }

    pub fn last(&self) -> Option<&RangeUnit> {
        self.units.last()
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.units.iter().filter_map(|unit| match unit {
            RangeUnit::Date(date) => Some(*date),
            RangeUnit::Season(_) => None,
        })
    }

    pub fn seasons(&self) -> impl Iterator<Item = Season> + '_ {
        self.units.iter().filter_map(|unit| match unit {
            RangeUnit::Season(season) => Some(*season),
            RangeUnit::Date(_) => None,
        })
    }

    /// True when the season's start year falls inside the range's year bounds.
    pub fn covers_season(&self, season: &Season) -> bool {
        let (Some(first), Some(last)) = (self.first(), self.last()) else {
            return false;
        };
        let year = season.start_year();
        let above_floor = self.unbounded_past() || year >= first.anchor_year();
        let below_ceiling = self.unbounded_future() || year <= last.anchor_year();
        above_floor && below_ceiling
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchTarget {
    Season(Season),
    Date(NaiveDate),
    Match(String),
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Season(season) => write!(f, "{season}"),
            Self::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            Self::Match(link) => f.write_str(link),
        }
    }
}

/// One discrete scrape target, consumed exactly once by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FetchUnit {
    pub sport: String,
    pub league: Option<String>,
    pub target: FetchTarget,
    pub markets: BTreeSet<String>,
}

impl FetchUnit {
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.sport,
            self.league.as_deref().unwrap_or("*"),
            self.target
        )
    }
}

/// Current prices one bookmaker quotes for one market, in outcome order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsEntry {
    pub bookmaker: String,
    pub market: String,
    pub prices: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub bookmaker: String,
    pub market: String,
    pub outcome: u32,
    pub recorded_at: DateTime<Utc>,
    pub price: f64,
}

/// Structured match record handed over by the page fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub match_id: String,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub kickoff: Option<DateTime<Utc>>,
    #[serde(default)]
    pub odds: Vec<OddsEntry>,
    /// `None` for preview scrapes that skip the odds-history timeline.
    #[serde(default)]
    pub history: Option<Vec<HistoryPoint>>,
}

/// Last-seen content digests for one match, keyed by `match_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFingerprint {
    pub match_id: String,
    pub current_odds_digest: String,
    pub history_digest: Option<String>,
    #[serde(default)]
    pub entry_digests: BTreeMap<String, String>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeVerdict {
    New,
    Unchanged,
    ChangedOdds,
    ChangedHistory,
}

impl ChangeVerdict {
    pub fn should_persist(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Unchanged => "UNCHANGED",
            Self::ChangedOdds => "CHANGED_ODDS",
            Self::ChangedHistory => "CHANGED_HISTORY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityPolicy {
    Aggressive,
    #[default]
    Normal,
    Conservative,
}

impl FromStr for SensitivityPolicy {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "aggressive" => Ok(Self::Aggressive),
            "normal" => Ok(Self::Normal),
            "conservative" => Ok(Self::Conservative),
            other => Err(format!(
                "unknown sensitivity '{other}' (expected aggressive, normal or conservative)"
            )),
        }
    }
}

impl fmt::Display for SensitivityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aggressive => f.write_str("aggressive"),
            Self::Normal => f.write_str("normal"),
            Self::Conservative => f.write_str("conservative"),
        }
    }
}
