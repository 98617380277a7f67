//! Diff-and-roll: the shared update rule for every "current vs previous"
//! column pair (IPs, ports, hostnames, ESSIDs) and for finding presence.

use std::collections::BTreeSet;
use std::net::IpAddr;

pub const IPS_CAP: usize = 200;
pub const PORTS_CAP: usize = 500;
pub const HOSTNAMES_CAP: usize = 50;
pub const ESSIDS_CAP: usize = 50;

/// Three-way split of a stored set against a freshly observed one. Each part is sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T> {
    pub added: Vec<T>,
    pub kept: Vec<T>,
    pub removed: Vec<T>,
}

impl<T> SetDiff<T> {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn diff_sets<T: Ord + Clone>(stored: &[T], observed: &[T]) -> SetDiff<T> {
    let stored: BTreeSet<&T> = stored.iter().collect();
    let observed: BTreeSet<&T> = observed.iter().collect();
    SetDiff {
        added: observed.difference(&stored).map(|t| (*t).clone()).collect(),
        kept: observed.intersection(&stored).map(|t| (*t).clone()).collect(),
        removed: stored.difference(&observed).map(|t| (*t).clone()).collect(),
    }
}

/// New current/previous pair after applying an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rolled<T> {
    /// The observed set, deduplicated and sorted.
    pub current: Vec<T>,
    /// Most recently dropped first, at most `cap` entries.
    pub previous: Vec<T>,
    pub diff: SetDiff<T>,
}

/// Replace `current` with `observed`, pushing dropped items onto the front of
/// `previous` and evicting the oldest entries beyond `cap`.
///
/// Items that come back stay in `previous` too; it is a log of what has been
/// seen before, not a complement of `current`.
pub fn diff_and_roll<T: Ord + Clone>(
    current: &[T],
    previous: &[T],
    observed: impl IntoIterator<Item = T>,
    cap: usize,
) -> Rolled<T> {
    let observed: Vec<T> = observed.into_iter().collect::<BTreeSet<T>>().into_iter().collect();
    let diff = diff_sets(current, &observed);

    let mut seen = BTreeSet::new();
    let mut rolled = Vec::with_capacity(diff.removed.len() + previous.len());
    for item in diff.removed.iter().chain(previous.iter()) {
        if seen.insert(item) {
            rolled.push(item.clone());
        }
    }
    rolled.truncate(cap);

    Rolled {
        current: observed,
        previous: rolled,
        diff,
    }
}

/// Split a stored `a;b;c` column, dropping blanks.
pub fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn join_list<T: ToString>(items: &[T]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    Some(
        items
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(";"),
    )
}

/// Parse a stored port list, ignoring anything that is not a port number.
pub fn split_ports(raw: Option<&str>) -> Vec<u16> {
    split_list(raw)
        .iter()
        .filter_map(|p| p.parse::<u16>().ok())
        .collect()
}

/// Numeric ordering for addresses; unparsable entries sort last, by text.
pub fn sort_ips(ips: &mut [String]) {
    ips.sort_by_cached_key(|ip| match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => (0u8, u128::from(u32::from(v4)), String::new()),
        Ok(IpAddr::V6(v6)) => (1u8, u128::from(v6), String::new()),
        Err(_) => (2u8, 0, ip.clone()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn diff_splits_three_ways() {
        let d = diff_sets(&[22u16, 80, 443], &[80, 443, 8080]);
        assert_eq!(d.added, vec![8080]);
        assert_eq!(d.kept, vec![80, 443]);
        assert_eq!(d.removed, vec![22]);
        assert!(!d.is_unchanged());
    }

    #[test]
    fn roll_moves_removed_to_front_of_previous() {
        let r = diff_and_roll(&[22u16, 80], &[21], vec![80, 443, 443], PORTS_CAP);
        assert_eq!(r.current, vec![80, 443]);
        assert_eq!(r.previous, vec![22, 21]);
        assert_eq!(r.diff.added, vec![443]);
    }

    #[test]
    fn roll_is_idempotent() {
        let first = diff_and_roll(&[22u16, 80], &[], vec![80], PORTS_CAP);
        let second = diff_and_roll(&first.current, &first.previous, vec![80], PORTS_CAP);
        assert_eq!(first.previous, second.previous);
        assert_eq!(first.current, second.current);
        assert!(second.diff.is_unchanged());
    }

    #[test]
    fn roll_evicts_oldest_beyond_cap() {
        let previous: Vec<u16> = (1..=5).collect();
        let r = diff_and_roll(&[100u16, 200], &previous, Vec::new(), 4);
        assert_eq!(r.previous, vec![100, 200, 1, 2]);
        assert!(r.current.is_empty());
    }

    #[test]
    fn roll_does_not_duplicate_previous() {
        let r = diff_and_roll(&s(&["a"]), &s(&["a", "b"]), s(&["c"]), 10);
        assert_eq!(r.previous, s(&["a", "b"]));
    }

    #[test]
    fn list_codec() {
        assert_eq!(split_list(Some(" a;;b ; ")), s(&["a", "b"]));
        assert!(split_list(None).is_empty());
        assert_eq!(join_list(&[80u16, 443]), Some("80;443".to_string()));
        assert_eq!(join_list::<u16>(&[]), None);
        assert_eq!(split_ports(Some("22;x;80;70000")), vec![22, 80]);
    }

    #[test]
    fn ips_sort_numerically() {
        let mut ips = s(&["10.0.0.10", "fe80::1", "10.0.0.2", "bogus"]);
        sort_ips(&mut ips);
        assert_eq!(ips, s(&["10.0.0.2", "10.0.0.10", "fe80::1", "bogus"]));
    }
}
