/* src/timescope.rs */
#![warn(missing_docs)]
//! # TimeScope: Scoped Wall-Clock Diagnostics
//!
//! Scope-bound timing instrumentation for latency-critical inference paths.
//! A [`TimeScope`] captures a start instant on construction and, when the
//! scope exits by any path (including unwinding), emits a structured log line
//! if the elapsed wall time exceeded its threshold. The report auto-scales
//! the elapsed value to the most readable unit, from seconds down to
//! nanoseconds.
//!
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use std::time::{Duration, Instant};

use tracing::info;

/// Unit ladder for elapsed-time formatting, coarsest first.
const TIME_UNITS: [&str; 4] = ["s", "ms", "µs", "ns"];

/// Default reporting threshold: scopes faster than this stay silent.
pub const DEFAULT_THRESHOLD: Duration = Duration::from_millis(1);

/// Formats an elapsed duration using the most readable unit.
///
/// The value is scaled down the unit ladder until it exceeds `1`, then
/// rounded to one decimal place. Sub-nanosecond durations render as `0ns`.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use kinetra::timescope::format_elapsed;
///
/// assert_eq!(format_elapsed(Duration::from_millis(2500)), "2.5s");
/// assert_eq!(format_elapsed(Duration::from_micros(3200)), "3.2ms");
/// ```
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    let mut value = elapsed.as_secs_f64();
    let mut unit = 0;
    while unit + 1 < TIME_UNITS.len() && value <= 1.0 {
        value *= 1000.0;
        unit += 1;
    }
    format!("{}{}", (value * 10.0).round() / 10.0, TIME_UNITS[unit])
}

/// A scoped wall-clock timer that reports on exit.
///
/// Construction captures `Instant::now()`. The report is emitted from
/// [`Drop`], which guarantees emission on every exit path of the enclosing
/// scope, including propagated panics and early `?` returns. The wrapped
/// computation's result is never touched; the scope is purely observational.
///
/// # Example
/// ```
/// use kinetra::timescope::TimeScope;
///
/// {
///     let _scope = TimeScope::new("predict_one_action_7");
///     // ... timed work ...
/// } // report emitted here if the work exceeded 1ms
/// ```
#[derive(Debug)]
pub struct TimeScope {
    tag: String,
    note: Option<String>,
    threshold: Duration,
    start: Instant,
}

impl TimeScope {
    /// Creates a scope with the default 1ms reporting threshold.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            note: None,
            threshold: DEFAULT_THRESHOLD,
            start: Instant::now(),
        }
    }

    /// Creates a scope with an explicit reporting threshold.
    #[must_use]
    pub fn with_threshold(tag: impl Into<String>, threshold: Duration) -> Self {
        Self {
            tag: tag.into(),
            note: None,
            threshold,
            start: Instant::now(),
        }
    }

    /// Attaches a free-form note appended to the report tag.
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Wall time elapsed since the scope was entered.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed time formatted with [`format_elapsed`].
    #[must_use]
    pub fn formatted(&self) -> String {
        format_elapsed(self.elapsed())
    }

    /// Whether the elapsed time has crossed the reporting threshold.
    #[must_use]
    pub fn exceeded(&self) -> bool {
        self.elapsed() > self.threshold
    }

    /// Whether the elapsed time has crossed an explicit threshold.
    #[must_use]
    pub fn exceeded_by(&self, threshold: Duration) -> bool {
        self.elapsed() > threshold
    }
}

impl Drop for TimeScope {
    fn drop(&mut self) {
        if self.exceeded() {
            let tag = match &self.note {
                Some(note) => format!("{}-{}", self.tag, note),
                None => self.tag.clone(),
            };
            info!(
                target: "kinetra::timescope",
                scope = %tag,
                elapsed = %self.formatted(),
                "[{tag}]: Exec Time={}",
                self.formatted()
            );
        }
    }
}

// =====================================================================================
// PRODUCTION TESTING & VALIDATION
// =====================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_picks_readable_unit() {
        assert_eq!(format_elapsed(Duration::from_secs(2)), "2s");
        assert_eq!(format_elapsed(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_elapsed(Duration::from_micros(3200)), "3.2ms");
        assert_eq!(format_elapsed(Duration::from_nanos(4500)), "4.5µs");
        assert_eq!(format_elapsed(Duration::from_nanos(7)), "7ns");
    }

    #[test]
    fn format_handles_zero() {
        assert_eq!(format_elapsed(Duration::ZERO), "0ns");
    }

    #[test]
    fn threshold_gates_reporting() {
        let scope = TimeScope::with_threshold("gate", Duration::from_secs(3600));
        assert!(!scope.exceeded());

        let scope = TimeScope::with_threshold("gate", Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert!(scope.exceeded());
        assert!(scope.exceeded_by(Duration::from_nanos(1)));
    }

    #[test]
    fn elapsed_is_monotonic() {
        let scope = TimeScope::new("monotonic");
        let first = scope.elapsed();
        std::thread::sleep(Duration::from_millis(1));
        assert!(scope.elapsed() >= first);
    }

    #[test]
    fn report_survives_unwind() {
        // Drop must run (and not double-panic) while unwinding.
        let result = std::panic::catch_unwind(|| {
            let _scope = TimeScope::with_threshold("unwind", Duration::ZERO);
            std::thread::sleep(Duration::from_millis(1));
            panic!("forced unwind");
        });
        assert!(result.is_err());
    }

    #[test]
    fn note_is_appended_to_tag() {
        let scope = TimeScope::new("predict").with_note("warmup");
        assert_eq!(scope.note.as_deref(), Some("warmup"));
    }
}
