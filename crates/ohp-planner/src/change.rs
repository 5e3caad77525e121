//! Fingerprint comparison under a sensitivity policy.

use std::collections::BTreeMap;

use ohp_core::{ChangeVerdict, MatchFingerprint, SensitivityPolicy};
use ohp_storage::RecordDigests;

/// Below this share of unchanged entries the aggressive policy reports an odds change.
pub const AGGRESSIVE_SIMILARITY_THRESHOLD: f64 = 0.95;

/// Share of bookmaker/market entries whose digests match, over the union of both key sets.
pub fn similarity(fresh: &BTreeMap<String, String>, stored: &BTreeMap<String, String>) -> f64 {
    let union = fresh
        .keys()
        .chain(stored.keys().filter(|key| !fresh.contains_key(*key)))
        .count();
    if union == 0 {
        return 1.0;
    }
    let matching = fresh
        .iter()
        .filter(|(key, digest)| stored.get(*key) == Some(*digest))
        .count();
    matching as f64 / union as f64
}

/// A preview record carries no history, which never counts as a history change.
fn history_changed(fresh: Option<&str>, stored: Option<&str>) -> bool {
    match fresh {
        Some(fresh) => stored != Some(fresh),
        None => false,
    }
}

fn odds_changed(fresh: &RecordDigests, stored: &MatchFingerprint, policy: SensitivityPolicy) -> bool {
    match policy {
        SensitivityPolicy::Aggressive => {
            similarity(&fresh.entry_digests, &stored.entry_digests) < AGGRESSIVE_SIMILARITY_THRESHOLD
        }
        SensitivityPolicy::Normal | SensitivityPolicy::Conservative => {
            fresh.current_odds_digest != stored.current_odds_digest
        }
    }
}

pub fn classify(
    fresh: &RecordDigests,
    stored: Option<&MatchFingerprint>,
    policy: SensitivityPolicy,
) -> ChangeVerdict {
    let Some(stored) = stored else {
        return ChangeVerdict::New;
    };
    let history = history_changed(fresh.history_digest.as_deref(), stored.history_digest.as_deref());

    if policy == SensitivityPolicy::Conservative {
        // Any difference at all is worth a re-save.
        if history {
            return ChangeVerdict::ChangedHistory;
        }
        return ChangeVerdict::ChangedOdds;
    }

    if odds_changed(fresh, stored, policy) {
        ChangeVerdict::ChangedOdds
    } else if history {
        ChangeVerdict::ChangedHistory
    } else {
        ChangeVerdict::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entries(total: usize, changed: usize) -> BTreeMap<String, String> {
        (0..total)
            .map(|i| {
                let digest = if i < changed { format!("moved-{i}") } else { format!("same-{i}") };
                (format!("bookmaker-{i}|1x2"), digest)
            })
            .collect()
    }

    fn digests(odds: &str, history: Option<&str>, entry_digests: BTreeMap<String, String>) -> RecordDigests {
        RecordDigests {
            current_odds_digest: odds.to_string(),
            history_digest: history.map(str::to_string),
            entry_digests,
        }
    }

    fn stored(odds: &str, history: Option<&str>, entry_digests: BTreeMap<String, String>) -> MatchFingerprint {
        digests(odds, history, entry_digests).to_fingerprint("m-1", Utc::now())
    }

    #[test]
    fn unseen_match_is_new_under_every_policy() {
        let fresh = digests("a", Some("h"), entries(3, 0));
        for policy in [
            SensitivityPolicy::Aggressive,
            SensitivityPolicy::Normal,
            SensitivityPolicy::Conservative,
        ] {
            assert_eq!(classify(&fresh, None, policy), ChangeVerdict::New);
        }
    }

    #[test]
    fn identical_digests_are_unchanged_for_normal_and_aggressive() {
        let fresh = digests("a", Some("h"), entries(3, 0));
        let known = stored("a", Some("h"), entries(3, 0));
        assert_eq!(classify(&fresh, Some(&known), SensitivityPolicy::Normal), ChangeVerdict::Unchanged);
        assert_eq!(
            classify(&fresh, Some(&known), SensitivityPolicy::Aggressive),
            ChangeVerdict::Unchanged
        );
    }

    #[test]
    fn conservative_always_saves_known_matches() {
        let fresh = digests("a", Some("h"), entries(3, 0));
        let known = stored("a", Some("h"), entries(3, 0));
        assert_eq!(
            classify(&fresh, Some(&known), SensitivityPolicy::Conservative),
            ChangeVerdict::ChangedOdds
        );
    }

    #[test]
    fn history_only_change_is_reported_by_every_policy() {
        let fresh = digests("a", Some("h2"), entries(3, 0));
        let known = stored("a", Some("h1"), entries(3, 0));
        for policy in [
            SensitivityPolicy::Aggressive,
            SensitivityPolicy::Normal,
            SensitivityPolicy::Conservative,
        ] {
            assert_eq!(
                classify(&fresh, Some(&known), policy),
                ChangeVerdict::ChangedHistory,
                "{policy}"
            );
        }
    }

    #[test]
    fn odds_change_takes_priority_over_history_for_normal() {
        let fresh = digests("b", Some("h2"), entries(3, 1));
        let known = stored("a", Some("h1"), entries(3, 0));
        assert_eq!(classify(&fresh, Some(&known), SensitivityPolicy::Normal), ChangeVerdict::ChangedOdds);
    }

    #[test]
    fn aggressive_tolerates_small_drift() {
        let baseline = entries(50, 0);
        let known = stored("a", Some("h"), baseline);

        // 48 of 50 entries unchanged: 96% similar.
        let slight = digests("b", Some("h"), entries(50, 2));
        assert!((similarity(&slight.entry_digests, &known.entry_digests) - 0.96).abs() < 1e-9);
        assert_eq!(
            classify(&slight, Some(&known), SensitivityPolicy::Aggressive),
            ChangeVerdict::Unchanged
        );
        assert_eq!(classify(&slight, Some(&known), SensitivityPolicy::Normal), ChangeVerdict::ChangedOdds);

        // 47 of 50: 94% similar.
        let broad = digests("c", Some("h"), entries(50, 3));
        assert_eq!(
            classify(&broad, Some(&known), SensitivityPolicy::Aggressive),
            ChangeVerdict::ChangedOdds
        );
    }

    #[test]
    fn similarity_counts_added_and_removed_entries() {
        let mut fresh = entries(4, 0);
        fresh.insert("newbook|1x2".into(), "x".into());
        let mut stored = entries(4, 0);
        stored.insert("oldbook|1x2".into(), "y".into());
        assert!((similarity(&fresh, &stored) - 4.0 / 6.0).abs() < 1e-9);
        assert_eq!(similarity(&BTreeMap::new(), &BTreeMap::new()), 1.0);
    }

    #[test]
    fn preview_record_does_not_flag_history() {
        let fresh = digests("a", None, entries(3, 0));
        let known = stored("a", Some("h"), entries(3, 0));
        assert_eq!(classify(&fresh, Some(&known), SensitivityPolicy::Normal), ChangeVerdict::Unchanged);

        let fresh = digests("a", Some("h"), entries(3, 0));
        let preview_known = stored("a", None, entries(3, 0));
        assert_eq!(
            classify(&fresh, Some(&preview_known), SensitivityPolicy::Normal),
            ChangeVerdict::ChangedHistory
        );
    }
}
