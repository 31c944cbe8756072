//! # Request Statistics
//!
//! Lock-free success/failure counters per operation class, updated by the
//! completion supervisor once per engine job. Offload jobs are not counted.
//!
//! ```rust
//! use cedev::stats::CeStats;
//!
//! let stats = CeStats::new();
//! stats.record_encrypt(true);
//! stats.record_sha(false);
//!
//! let snap = stats.snapshot();
//! assert_eq!(snap.enc_success, 1);
//! assert_eq!(snap.sha_fail, 1);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-device request counters
#[derive(Debug, Default)]
pub struct CeStats {
    enc_success: AtomicU64,
    enc_fail: AtomicU64,
    dec_success: AtomicU64,
    dec_fail: AtomicU64,
    sha_success: AtomicU64,
    sha_fail: AtomicU64,
}

/// Point-in-time copy of [`CeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub enc_success: u64,
    pub enc_fail: u64,
    pub dec_success: u64,
    pub dec_fail: u64,
    pub sha_success: u64,
    pub sha_fail: u64,
}

impl CeStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_encrypt(&self, ok: bool) {
        Self::bump(ok, &self.enc_success, &self.enc_fail);
    }

    pub fn record_decrypt(&self, ok: bool) {
        Self::bump(ok, &self.dec_success, &self.dec_fail);
    }

    pub fn record_sha(&self, ok: bool) {
        Self::bump(ok, &self.sha_success, &self.sha_fail);
    }

    fn bump(ok: bool, success: &AtomicU64, fail: &AtomicU64) {
        if ok {
            success.fetch_add(1, Ordering::Relaxed);
        } else {
            fail.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take a consistent-enough copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enc_success: self.enc_success.load(Ordering::Relaxed),
            enc_fail: self.enc_fail.load(Ordering::Relaxed),
            dec_success: self.dec_success.load(Ordering::Relaxed),
            dec_fail: self.dec_fail.load(Ordering::Relaxed),
            sha_success: self.sha_success.load(Ordering::Relaxed),
            sha_fail: self.sha_fail.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.enc_success,
            &self.enc_fail,
            &self.dec_success,
            &self.dec_fail,
            &self.sha_success,
            &self.sha_fail,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cedev statistics:")?;
        writeln!(f, "  encrypt success : {}", self.enc_success)?;
        writeln!(f, "  encrypt fail    : {}", self.enc_fail)?;
        writeln!(f, "  decrypt success : {}", self.dec_success)?;
        writeln!(f, "  decrypt fail    : {}", self.dec_fail)?;
        writeln!(f, "  sha success     : {}", self.sha_success)?;
        writeln!(f, "  sha fail        : {}", self.sha_fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = CeStats::new();
        stats.record_encrypt(true);
        stats.record_encrypt(true);
        stats.record_decrypt(false);
        stats.record_sha(true);

        let snap = stats.snapshot();
        assert_eq!(snap.enc_success, 2);
        assert_eq!(snap.dec_fail, 1);
        assert_eq!(snap.sha_success, 1);
        assert_eq!(snap.sha_fail, 0);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_display() {
        let snap = StatsSnapshot { enc_success: 3, ..Default::default() };
        let text = snap.to_string();
        assert!(text.contains("encrypt success : 3"));
        assert!(text.contains("sha fail        : 0"));
    }
}
