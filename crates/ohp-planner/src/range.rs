//! Turns flexible `from`/`to` specs into concrete dates or seasons.
//!
//! Upcoming harvests work on calendar days; historic harvests work on one
//! season per covered start year. Resolution is pure: `today` is always
//! supplied by the caller.

use chrono::{Datelike, NaiveDate};
use ohp_core::{DateSpec, Granularity, HarvestMode, InvalidRange, RangeUnit, ResolvedRange, Season};

/// Endpoints after the default rules have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoints {
    Both(DateSpec, DateSpec),
    OpenPast(DateSpec),
    OpenFuture(DateSpec),
}

fn fill_defaults(from: Option<DateSpec>, to: Option<DateSpec>, mode: HarvestMode) -> Endpoints {
    match (from, to) {
        (None, None) => match mode {
            HarvestMode::Upcoming => Endpoints::OpenFuture(DateSpec::Now),
            HarvestMode::Historic => Endpoints::OpenPast(DateSpec::Now),
        },
        (Some(from), None) if from.is_range_type() => Endpoints::OpenFuture(from),
        (Some(from), None) => Endpoints::Both(from, from),
        (None, Some(to)) if to.is_range_type() => Endpoints::OpenPast(to),
        (None, Some(to)) => Endpoints::Both(to, to),
        (Some(from), Some(to)) => Endpoints::Both(from, to),
    }
}

fn check_supported(spec: &DateSpec, mode: HarvestMode) -> Result<(), InvalidRange> {
    let granularity = spec.granularity();
    let supported = match mode {
        HarvestMode::Upcoming => granularity != Granularity::SeasonRange,
        HarvestMode::Historic => !matches!(granularity, Granularity::Day | Granularity::Month),
    };
    if supported {
        Ok(())
    } else {
        Err(InvalidRange::IncompatibleGranularity { granularity, mode })
    }
}

pub fn resolve(
    from: Option<DateSpec>,
    to: Option<DateSpec>,
    mode: HarvestMode,
    today: NaiveDate,
) -> Result<ResolvedRange, InvalidRange> {
    for spec in from.iter().chain(to.iter()) {
        check_supported(spec, mode)?;
    }
    let endpoints = fill_defaults(from, to, mode);
    match mode {
        HarvestMode::Upcoming => resolve_days(endpoints, today),
        HarvestMode::Historic => resolve_seasons(endpoints, today),
    }
}

/// Parses optional raw tokens and resolves them in one step.
pub fn resolve_tokens(
    from: Option<&str>,
    to: Option<&str>,
    mode: HarvestMode,
    today: NaiveDate,
) -> Result<ResolvedRange, InvalidRange> {
    let from = from.map(str::parse::<DateSpec>).transpose()?;
    let to = to.map(str::parse::<DateSpec>).transpose()?;
    resolve(from, to, mode, today)
}

fn day_bounds(spec: DateSpec, today: NaiveDate) -> Result<(NaiveDate, NaiveDate), InvalidRange> {
    let malformed = || InvalidRange::MalformedToken(spec.to_string());
    match spec {
        DateSpec::Day(date) => Ok((date, date)),
        DateSpec::Now => Ok((today, today)),
        DateSpec::Month { year, month } => {
            let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(malformed)?;
            let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
            let last = NaiveDate::from_ymd_opt(next_year, next_month, 1)
                .and_then(|d| d.pred_opt())
                .ok_or_else(malformed)?;
            Ok((first, last))
        }
        DateSpec::Year(year) => {
            let first = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(malformed)?;
            let last = NaiveDate::from_ymd_opt(year, 12, 31).ok_or_else(malformed)?;
            Ok((first, last))
        }
        DateSpec::SeasonRange { .. } => Err(InvalidRange::IncompatibleGranularity {
            granularity: Granularity::SeasonRange,
            mode: HarvestMode::Upcoming,
        }),
    }
}

fn days_between(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = RangeUnit> {
    start
        .iter_days()
        .take_while(move |day| *day <= end)
        .map(RangeUnit::Date)
}

fn resolve_days(endpoints: Endpoints, today: NaiveDate) -> Result<ResolvedRange, InvalidRange> {
    match endpoints {
        // "now" to "now" is the open-ended upcoming listing starting today.
        Endpoints::Both(DateSpec::Now, DateSpec::Now) | Endpoints::OpenFuture(DateSpec::Now) => {
            Ok(ResolvedRange::open_future([RangeUnit::Date(today)]))
        }
        Endpoints::OpenFuture(spec) => {
            let (start, end) = day_bounds(spec, today)?;
            Ok(ResolvedRange::open_future(days_between(start, end)))
        }
        Endpoints::OpenPast(spec) => {
            let (start, end) = day_bounds(spec, today)?;
            Ok(ResolvedRange::open_past(days_between(start, end)))
        }
        Endpoints::Both(from, to) => {
            let (start, _) = day_bounds(from, today)?;
            let (_, end) = day_bounds(to, today)?;
            if start > end {
                return Err(InvalidRange::Reversed {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            Ok(ResolvedRange::bounded(days_between(start, end)))
        }
    }
}

fn start_year(spec: DateSpec, today: NaiveDate) -> Result<i32, InvalidRange> {
    match spec {
        DateSpec::Year(year) => Ok(year),
        DateSpec::SeasonRange { start, .. } => Ok(start),
        DateSpec::Now => Ok(today.year()),
        other => Err(InvalidRange::IncompatibleGranularity {
            granularity: other.granularity(),
            mode: HarvestMode::Historic,
        }),
    }
}

fn seasons_between(first: i32, last: i32, split: bool) -> impl Iterator<Item = RangeUnit> {
    (first..=last).map(move |year| {
        let season = if split { Season::split(year) } else { Season::Single(year) };
        RangeUnit::Season(season)
    })
}

fn resolve_seasons(endpoints: Endpoints, today: NaiveDate) -> Result<ResolvedRange, InvalidRange> {
    match endpoints {
        Endpoints::OpenPast(spec) => {
            let year = start_year(spec, today)?;
            Ok(ResolvedRange::open_past(seasons_between(year, year, spec.is_range_type())))
        }
        Endpoints::OpenFuture(spec) => {
            let year = start_year(spec, today)?;
            Ok(ResolvedRange::open_future(seasons_between(year, year, spec.is_range_type())))
        }
        Endpoints::Both(from, to) => {
            let mut first = start_year(from, today)?;
            let mut last = start_year(to, today)?;
            if first > last {
                // "from now back to 2019" reads naturally; normalize to ascending order.
                std::mem::swap(&mut first, &mut last);
            }
            let split = from.is_range_type() || to.is_range_type();
            Ok(ResolvedRange::bounded(seasons_between(first, last, split)))
        }
    }
}
