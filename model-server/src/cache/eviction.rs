//! Victim selection for the model cache.
//!
//! These functions only decide *which* keys go; the cache removes them under
//! its lock and unloads them afterwards.

use std::cmp::Reverse;

use tokio::time::{Duration, Instant};

/// Point-in-time view of one resident model.
#[derive(Debug, Clone)]
pub struct ResidentView {
    pub key: String,
    pub last_used: Instant,
    pub use_count: u64,
    pub active_requests: usize,
}

impl ResidentView {
    /// Protected models are never evicted: they are serving a request or were
    /// used within the grace window.
    pub fn is_protected(&self, now: Instant, grace: Duration) -> bool {
        self.active_requests > 0 || now.saturating_duration_since(self.last_used) < grace
    }
}

/// Least-recently-used victims needed to bring the resident count down to `keep_max`.
///
/// Protected models count towards the total but are skipped, so the result can
/// leave more than `keep_max` residents.
pub fn lru_victims(
    residents: &[ResidentView],
    keep_max: usize,
    now: Instant,
    grace: Duration,
) -> Vec<String> {
    if residents.len() <= keep_max {
        return Vec::new();
    }
    let excess = residents.len() - keep_max;

    let mut candidates: Vec<&ResidentView> = residents
        .iter()
        .filter(|r| !r.is_protected(now, grace))
        .collect();
    candidates.sort_by_key(|r| r.last_used);

    candidates
        .into_iter()
        .take(excess)
        .map(|r| r.key.clone())
        .collect()
}

/// Victims for a memory reclaim.
///
/// In emergency mode every unprotected model goes. Otherwise protected models
/// stay, and the most used unprotected ones fill the remaining room up to
/// `keep_count` residents in total.
pub fn reclaim_victims(
    residents: &[ResidentView],
    emergency: bool,
    keep_count: usize,
    now: Instant,
    grace: Duration,
) -> Vec<String> {
    let (protected, mut unprotected): (Vec<&ResidentView>, Vec<&ResidentView>) = residents
        .iter()
        .partition(|r| r.is_protected(now, grace));

    if emergency {
        return unprotected.into_iter().map(|r| r.key.clone()).collect();
    }

    let room = keep_count.saturating_sub(protected.len());
    unprotected.sort_by_key(|r| Reverse((r.use_count, r.last_used)));
    unprotected
        .into_iter()
        .skip(room)
        .map(|r| r.key.clone())
        .collect()
}

/// Unprotected models idle for longer than `idle_after`.
pub fn idle_victims(
    residents: &[ResidentView],
    idle_after: Duration,
    now: Instant,
    grace: Duration,
) -> Vec<String> {
    residents
        .iter()
        .filter(|r| !r.is_protected(now, grace))
        .filter(|r| now.saturating_duration_since(r.last_used) >= idle_after)
        .map(|r| r.key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(30);

    fn view(key: &str, idle_secs: u64, use_count: u64, active: usize, now: Instant) -> ResidentView {
        ResidentView {
            key: key.to_string(),
            last_used: now - Duration::from_secs(idle_secs),
            use_count,
            active_requests: active,
        }
    }

    fn setup() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn test_lru_picks_oldest_first() {
        let now = setup();
        let residents = vec![
            view("a", 100, 1, 0, now),
            view("b", 300, 1, 0, now),
            view("c", 200, 1, 0, now),
        ];
        assert_eq!(lru_victims(&residents, 1, now, GRACE), vec!["b", "c"]);
    }

    #[test]
    fn test_lru_under_limit_is_noop() {
        let now = setup();
        let residents = vec![view("a", 100, 1, 0, now)];
        assert!(lru_victims(&residents, 2, now, GRACE).is_empty());
    }

    #[test]
    fn test_lru_skips_active_and_recent() {
        let now = setup();
        let residents = vec![
            view("busy", 500, 1, 1, now),
            view("fresh", 5, 1, 0, now),
            view("stale", 100, 1, 0, now),
        ];
        assert_eq!(lru_victims(&residents, 0, now, GRACE), vec!["stale"]);
    }

    #[test]
    fn test_reclaim_emergency_takes_all_unprotected() {
        let now = setup();
        let residents = vec![
            view("a", 100, 9, 0, now),
            view("b", 100, 1, 0, now),
            view("c", 100, 1, 2, now),
        ];
        let mut victims = reclaim_victims(&residents, true, 1, now, GRACE);
        victims.sort();
        assert_eq!(victims, vec!["a", "b"]);
    }

    #[test]
    fn test_reclaim_keeps_most_used() {
        let now = setup();
        let residents = vec![
            view("rare", 100, 1, 0, now),
            view("popular", 200, 20, 0, now),
            view("middle", 50, 5, 0, now),
        ];
        let mut victims = reclaim_victims(&residents, false, 1, now, GRACE);
        victims.sort();
        assert_eq!(victims, vec!["middle", "rare"]);
    }

    #[test]
    fn test_reclaim_protected_use_up_keep_count() {
        let now = setup();
        let residents = vec![view("busy", 100, 1, 1, now), view("popular", 100, 50, 0, now)];
        assert_eq!(reclaim_victims(&residents, false, 1, now, GRACE), vec!["popular"]);
    }

    #[test]
    fn test_idle_victims() {
        let now = setup();
        let residents = vec![view("old", 2000, 1, 0, now), view("recent", 60, 1, 0, now)];
        assert_eq!(
            idle_victims(&residents, Duration::from_secs(1800), now, GRACE),
            vec!["old"]
        );
    }
}
