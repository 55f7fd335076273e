// Copyright 2018-2026 the Deno authors. MIT license.

//! Edge rate limiting.
//!
//! A [`RateCounter`] keeps a per-entry log of `(timestamp, delta)` events
//! and answers windowed rate and count queries; a [`PenaltyBox`] is a
//! TTL-bounded set of entries that have exceeded a limit. [`check_rate`]
//! combines the two into the single decision the guest calls.
//!
//! Every operation has an `*_at` variant taking an explicit instant; the
//! plain variants use the wall clock.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;

/// Events older than this are lazily pruned on each increment.
const EVENT_RETENTION: Duration = Duration::from_secs(3600);

const MIN_TTL: u32 = 60;
const MAX_TTL: u32 = 3600;

#[derive(Debug, Default)]
pub struct RateCounter {
  entries: Mutex<HashMap<String, Vec<(Instant, u32)>>>,
}

impl RateCounter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn increment(&self, entry: &str, delta: u32) {
    self.increment_at(entry, delta, Instant::now());
  }

  pub fn increment_at(&self, entry: &str, delta: u32, now: Instant) {
    let mut entries = self.entries.lock();
    let events = entries.entry(entry.to_string()).or_default();
    events.retain(|(at, _)| now.duration_since(*at) < EVENT_RETENTION);
    events.push((now, delta));
  }

  /// Estimated rate over the trailing window, in events per second.
  /// A zero-length window reports a rate of zero.
  pub fn lookup_rate(&self, entry: &str, window_secs: u32) -> u32 {
    self.lookup_rate_at(entry, window_secs, Instant::now())
  }

  pub fn lookup_rate_at(
    &self,
    entry: &str,
    window_secs: u32,
    now: Instant,
  ) -> u32 {
    if window_secs == 0 {
      return 0;
    }
    self.sum_window(entry, window_secs, now) / window_secs
  }

  /// Sum of deltas over the trailing window.
  pub fn lookup_count(&self, entry: &str, duration_secs: u32) -> u32 {
    self.lookup_count_at(entry, duration_secs, Instant::now())
  }

  pub fn lookup_count_at(
    &self,
    entry: &str,
    duration_secs: u32,
    now: Instant,
  ) -> u32 {
    self.sum_window(entry, duration_secs, now)
  }

  fn sum_window(&self, entry: &str, window_secs: u32, now: Instant) -> u32 {
    let window = Duration::from_secs(u64::from(window_secs));
    let entries = self.entries.lock();
    let Some(events) = entries.get(entry) else {
      return 0;
    };
    events
      .iter()
      .filter(|(at, _)| now.duration_since(*at) < window)
      .map(|(_, delta)| delta)
      .sum()
  }
}

#[derive(Debug, Default)]
pub struct PenaltyBox {
  entries: Mutex<HashMap<String, Instant>>,
}

impl PenaltyBox {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&self, entry: &str, ttl_secs: u32) {
    self.add_at(entry, ttl_secs, Instant::now());
  }

  /// Add `entry` for `ttl_secs`, clamped to [60, 3600] seconds and then
  /// rounded down to a whole minute.
  pub fn add_at(&self, entry: &str, ttl_secs: u32, now: Instant) {
    let ttl = quantize_ttl(ttl_secs);
    let expiry = now + Duration::from_secs(u64::from(ttl));
    self
      .entries
      .lock()
      .insert(entry.to_string(), expiry);
  }

  pub fn has(&self, entry: &str) -> bool {
    self.has_at(entry, Instant::now())
  }

  /// Expired entries read as absent and are dropped on the way out.
  pub fn has_at(&self, entry: &str, now: Instant) -> bool {
    let mut entries = self.entries.lock();
    match entries.get(entry) {
      Some(expiry) if now < *expiry => true,
      Some(_) => {
        entries.remove(entry);
        false
      }
      None => false,
    }
  }
}

fn quantize_ttl(ttl_secs: u32) -> u32 {
  (ttl_secs.clamp(MIN_TTL, MAX_TTL) / 60) * 60
}

/// The combined rate-limit decision: returns `true` when `entry` should
/// be blocked.
///
/// An entry already in the penalty box stays blocked without counting a
/// new event. Otherwise the event is recorded, and if the delta sum over
/// the trailing window then exceeds `limit`, the entry enters the
/// penalty box for `ttl_secs`.
pub fn check_rate(
  rc: &RateCounter,
  pb: &PenaltyBox,
  entry: &str,
  delta: u32,
  window_secs: u32,
  limit: u32,
  ttl_secs: u32,
) -> bool {
  check_rate_at(rc, pb, entry, delta, window_secs, limit, ttl_secs, Instant::now())
}

#[allow(clippy::too_many_arguments)]
pub fn check_rate_at(
  rc: &RateCounter,
  pb: &PenaltyBox,
  entry: &str,
  delta: u32,
  window_secs: u32,
  limit: u32,
  ttl_secs: u32,
  now: Instant,
) -> bool {
  if pb.has_at(entry, now) {
    return true;
  }
  rc.increment_at(entry, delta, now);
  if rc.lookup_count_at(entry, window_secs, now) > limit {
    log::debug!("rate limit exceeded for {entry:?}, penalizing");
    pb.add_at(entry, ttl_secs, now);
    return true;
  }
  false
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rate_is_windowed_sum_divided_by_window() {
    let rc = RateCounter::new();
    let start = Instant::now();
    for i in 0..10 {
      rc.increment_at("ip=A", 2, start + Duration::from_secs(i));
    }
    let now = start + Duration::from_secs(10);
    // Events at start+1..=start+9 fall inside the trailing 10s window;
    // the event at `start` is exactly 10s old and excluded.
    assert_eq!(rc.lookup_count_at("ip=A", 10, now), 18);
    assert_eq!(rc.lookup_rate_at("ip=A", 10, now), 1);
    assert_eq!(rc.lookup_rate_at("ip=A", 0, now), 0);
    assert_eq!(rc.lookup_rate_at("missing", 10, now), 0);
  }

  #[test]
  fn events_older_than_an_hour_are_pruned() {
    let rc = RateCounter::new();
    let start = Instant::now();
    rc.increment_at("e", 1, start);
    rc.increment_at("e", 1, start + Duration::from_secs(3601));
    let entries = rc.entries.lock();
    assert_eq!(entries.get("e").unwrap().len(), 1);
  }

  #[test]
  fn penalty_box_ttl_is_quantized() {
    assert_eq!(quantize_ttl(0), 60);
    assert_eq!(quantize_ttl(59), 60);
    assert_eq!(quantize_ttl(65), 60);
    assert_eq!(quantize_ttl(119), 60);
    assert_eq!(quantize_ttl(120), 120);
    assert_eq!(quantize_ttl(3599), 3540);
    assert_eq!(quantize_ttl(9999), 3600);
  }

  #[test]
  fn penalty_box_expires() {
    let pb = PenaltyBox::new();
    let start = Instant::now();
    pb.add_at("ip=A", 65, start);
    // quantized down to 60s
    assert!(pb.has_at("ip=A", start + Duration::from_secs(59)));
    assert!(!pb.has_at("ip=A", start + Duration::from_secs(61)));
    // expired entries are dropped
    assert!(pb.entries.lock().is_empty());
  }

  #[test]
  fn check_rate_blocks_on_the_fourth_call() {
    let rc = RateCounter::new();
    let pb = PenaltyBox::new();
    let start = Instant::now();
    let mut blocked = Vec::new();
    for i in 0..4 {
      let now = start + Duration::from_millis(250 * i);
      blocked.push(check_rate_at(&rc, &pb, "ip=A", 1, 10, 2, 65, now));
    }
    // The third call pushes the windowed sum to 3 > 2 and penalizes;
    // the fourth is blocked by the penalty box.
    assert_eq!(blocked, vec![false, false, true, true]);
    assert!(pb.has_at("ip=A", start + Duration::from_secs(59)));
    // ttl=65 quantizes to a whole minute
    assert!(!pb.has_at("ip=A", start + Duration::from_secs(61)));
  }

  #[test]
  fn penalized_entries_do_not_record_new_events() {
    let rc = RateCounter::new();
    let pb = PenaltyBox::new();
    let start = Instant::now();
    assert!(check_rate_at(&rc, &pb, "ip=A", 40, 10, 2, 120, start));
    assert!(check_rate_at(
      &rc,
      &pb,
      "ip=A",
      1,
      10,
      2,
      120,
      start + Duration::from_secs(1)
    ));
    assert_eq!(rc.entries.lock().get("ip=A").unwrap().len(), 1);
  }
}
