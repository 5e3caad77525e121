//! Intersects a requested season range with what a league actually has on file.

use std::collections::BTreeSet;
use std::fmt;

use ohp_adapters::DiscoveryFailure;
use ohp_core::{FetchTarget, FetchUnit, ResolvedRange, Season};
use serde::{Deserialize, Serialize};

use crate::cache::DiscoveryCache;

/// The league exists but none of its seasons fall inside the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoOverlapWarning {
    pub league: String,
    pub requested: String,
    pub available: Vec<Season>,
}

impl fmt::Display for NoOverlapWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let available = self
            .available
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "league {} has no season in {} (available: {})",
            self.league,
            self.requested,
            if available.is_empty() { "none" } else { &available }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intersection {
    Units(Vec<FetchUnit>),
    NoOverlap(NoOverlapWarning),
}

/// Human-readable form of a season range, open sides rendered as `..`.
pub fn describe_range(range: &ResolvedRange) -> String {
    let first = range.seasons().next().map(|s| s.to_string()).unwrap_or_default();
    let last = range.seasons().last().map(|s| s.to_string()).unwrap_or_default();
    match (range.unbounded_past(), range.unbounded_future()) {
        (true, _) => format!("..{last}"),
        (_, true) => format!("{first}.."),
        _ if first == last => first,
        _ => format!("{first}..{last}"),
    }
}

/// Pure part of the intersection: the league's own seasons that the request covers.
///
/// Comparison is by start year, so a `2023` request matches the `2023-2024` season.
pub fn select_seasons(requested: &ResolvedRange, available: &BTreeSet<Season>) -> Vec<Season> {
    available
        .iter()
        .filter(|season| requested.covers_season(season))
        .copied()
        .collect()
}

/// Lists `league`'s seasons (through the cache) and emits one unit per covered season.
pub async fn intersect(
    sport: &str,
    league: &str,
    markets: &BTreeSet<String>,
    requested: &ResolvedRange,
    cache: &DiscoveryCache,
) -> Result<Intersection, DiscoveryFailure> {
    let available = cache.list_seasons(sport, league).await?;
    let selected = select_seasons(requested, &available);
    if selected.is_empty() {
        return Ok(Intersection::NoOverlap(NoOverlapWarning {
            league: league.to_string(),
            requested: describe_range(requested),
            available: available.into_iter().collect(),
        }));
    }

    let units = selected
        .into_iter()
        .map(|season| FetchUnit {
            sport: sport.to_string(),
            league: Some(league.to_string()),
            target: FetchTarget::Season(season),
            markets: markets.clone(),
        })
        .collect();
    Ok(Intersection::Units(units))
}
