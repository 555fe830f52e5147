//! Playback control state and tick pacing.
//!
//! The controller owns the play/seek/speed flags and turns wall-clock time
//! into tick spans. Tick sizing is EMA-smoothed so a stalled frame does not
//! produce a giant catch-up batch afterwards.

use std::sync::Mutex;

use scope_core::Time;

use crate::{BOOTSTRAP_TICK_MS, MAX_TICK_DURATION_MS, PlaybackError};

struct ControlState {
    is_playing: bool,
    speed: f64,
    /// `None` until initialization freezes the log span. Targets are only
    /// clamped once bounds exist; a pre-initialization seek keeps its raw
    /// value and is clamped when bounds arrive.
    bounds: Option<(Time, Time)>,
    current_time: Time,
    seek_target: Option<Time>,
    until_time: Option<Time>,
    last_tick_millis: Option<f64>,
    last_range_millis: Option<f64>,
    /// Bumped on every completed backfill; the UI uses it to distinguish a
    /// seek from ordinary cursor motion.
    seek_count: u64,
}

impl ControlState {
    fn clamp(&self, t: Time) -> Time {
        match self.bounds {
            Some((start, end)) => t.clamp_to(start, end),
            None => t,
        }
    }
}

pub struct PlaybackController {
    state: Mutex<ControlState>,
}

impl PlaybackController {
    pub fn new() -> Self {
        PlaybackController {
            state: Mutex::new(ControlState {
                is_playing: false,
                speed: 1.0,
                bounds: None,
                current_time: Time::ZERO,
                seek_target: None,
                until_time: None,
                last_tick_millis: None,
                last_range_millis: None,
                seek_count: 0,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn set_bounds(&self, start: Time, end: Time) {
        let mut s = self.state.lock().unwrap();
        s.bounds = Some((start, end));
        s.current_time = s.current_time.clamp_to(start, end);
        s.seek_target = s.seek_target.map(|t| t.clamp_to(start, end));
        s.until_time = s.until_time.map(|t| t.clamp_to(start, end));
    }

    pub fn bounds(&self) -> (Time, Time) {
        self.state
            .lock()
            .unwrap()
            .bounds
            .unwrap_or((Time::ZERO, Time::ZERO))
    }

    pub fn current_time(&self) -> Time {
        self.state.lock().unwrap().current_time
    }

    pub fn set_current_time(&self, t: Time) {
        self.state.lock().unwrap().current_time = t;
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().unwrap().is_playing
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().unwrap().speed
    }

    pub fn seek_target(&self) -> Option<Time> {
        self.state.lock().unwrap().seek_target
    }

    pub fn until_time(&self) -> Option<Time> {
        self.state.lock().unwrap().until_time
    }

    pub fn last_seek_time(&self) -> u64 {
        self.state.lock().unwrap().seek_count
    }

    // -----------------------------------------------------------------------
    // Control operations
    // -----------------------------------------------------------------------

    /// Request a seek. Returns false for duplicate or no-op targets.
    pub fn seek_playback(&self, t: Time) -> bool {
        let mut s = self.state.lock().unwrap();
        let clamped = s.clamp(t);
        if s.seek_target == Some(clamped) || clamped == s.current_time {
            return false;
        }
        s.seek_target = Some(clamped);
        s.until_time = None;
        s.last_tick_millis = None;
        s.last_range_millis = None;
        true
    }

    /// Set a seek target without the duplicate/no-op guard; used when a
    /// subscription change needs a backfill at the current cursor.
    pub fn force_seek_target(&self, t: Time) {
        let mut s = self.state.lock().unwrap();
        let clamped = s.clamp(t);
        s.seek_target = Some(clamped);
        s.last_tick_millis = None;
        s.last_range_millis = None;
    }

    /// Mark the backfill for `target` complete.
    ///
    /// The target clears only when it is still the pending one; a newer seek
    /// issued mid-backfill keeps its claim.
    pub fn complete_seek(&self, target: Time) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.seek_target == Some(target) {
            s.seek_target = None;
            s.seek_count += 1;
            true
        } else {
            false
        }
    }

    /// Returns true when playback actually started.
    pub fn start_playback(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.is_playing || s.until_time.is_some() {
            return false;
        }
        s.is_playing = true;
        true
    }

    /// Play forward until `t`, then pause.
    pub fn play_until(&self, t: Time) -> Result<bool, PlaybackError> {
        let mut s = self.state.lock().unwrap();
        if s.is_playing || s.until_time.is_some() {
            return Ok(false);
        }
        if t <= s.current_time {
            return Err(PlaybackError::Precondition(format!(
                "playUntil target {t} is not past the cursor {}",
                s.current_time
            )));
        }
        s.until_time = Some(s.clamp(t));
        s.is_playing = true;
        Ok(true)
    }

    /// Returns true when playback was running.
    pub fn pause_playback(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        let was_playing = s.is_playing;
        s.is_playing = false;
        s.until_time = None;
        s.last_tick_millis = None;
        s.last_range_millis = None;
        was_playing
    }

    pub fn set_speed(&self, speed: f64) -> Result<(), PlaybackError> {
        if speed <= 0.0 || !speed.is_finite() {
            return Err(PlaybackError::Precondition(format!(
                "playback speed must be positive, got {speed}"
            )));
        }
        self.state.lock().unwrap().speed = speed;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tick sizing
    // -----------------------------------------------------------------------

    /// Compute this tick's span of log time in milliseconds.
    ///
    /// elapsed (20 ms bootstrap) x speed, clamped, then EMA-smoothed
    /// 0.9/0.1 against the prior range.
    pub fn next_range_millis(&self, now_millis: f64) -> f64 {
        let mut s = self.state.lock().unwrap();
        let elapsed = s
            .last_tick_millis
            .map_or(BOOTSTRAP_TICK_MS, |prior| (now_millis - prior).max(0.0));
        let scaled = (elapsed * s.speed).min(MAX_TICK_DURATION_MS);
        let range = match s.last_range_millis {
            Some(prior) => 0.9 * prior + 0.1 * scaled,
            None => scaled,
        };
        s.last_tick_millis = Some(now_millis);
        s.last_range_millis = Some(range);
        range
    }

    /// The tick's target time: cursor + range, clamped to the playable span.
    pub fn tick_end_time(&self, range_millis: f64) -> Time {
        let s = self.state.lock().unwrap();
        let (start, end) = s.bounds.unwrap_or((Time::ZERO, s.current_time));
        let limit = s.until_time.unwrap_or(end);
        s.current_time
            .add_nanos((range_millis * 1_000_000.0) as i64)
            .clamp_to(start, limit)
    }
}

impl Default for PlaybackController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(sec: i64) -> Time {
        Time { sec, nsec: 0 }
    }

    fn controller() -> PlaybackController {
        let c = PlaybackController::new();
        c.set_bounds(t(100), t(200));
        c.set_current_time(t(100));
        c
    }

    #[test]
    fn bootstrap_tick_spans_twenty_millis() {
        let c = controller();
        let range = c.next_range_millis(1000.0);
        assert!((range - 20.0).abs() < 1e-9);
    }

    #[test]
    fn tick_range_is_ema_smoothed() {
        let c = controller();
        let first = c.next_range_millis(1000.0);
        // 40 ms of wall time at speed 1: new sample is 40, smoothed toward it.
        let second = c.next_range_millis(1040.0);
        assert!((second - (0.9 * first + 0.1 * 40.0)).abs() < 1e-9);
    }

    #[test]
    fn tick_sample_clamps_after_a_stall() {
        let c = controller();
        c.next_range_millis(1000.0);
        // A 5-second stall contributes at most MAX_TICK_DURATION_MS.
        let range = c.next_range_millis(6000.0);
        assert!(range <= 0.9 * 20.0 + 0.1 * MAX_TICK_DURATION_MS + 1e-9);
    }

    #[test]
    fn speed_scales_the_sample() {
        let c = controller();
        c.set_speed(2.0).unwrap();
        let range = c.next_range_millis(1000.0);
        assert!((range - 40.0).abs() < 1e-9);
    }

    #[test]
    fn seek_clamps_to_bounds() {
        let c = controller();
        assert!(c.seek_playback(t(500)));
        assert_eq!(c.seek_target(), Some(t(200)));
    }

    #[test]
    fn duplicate_seek_target_is_a_no_op() {
        let c = controller();
        assert!(c.seek_playback(t(150)));
        assert!(!c.seek_playback(t(150)));
    }

    #[test]
    fn seek_to_current_time_is_a_no_op() {
        let c = controller();
        c.set_current_time(t(120));
        assert!(!c.seek_playback(t(120)));
    }

    #[test]
    fn seek_clears_until_time_and_timing_state() {
        let c = controller();
        c.play_until(t(180)).unwrap();
        c.next_range_millis(1000.0);
        assert!(c.seek_playback(t(150)));
        assert_eq!(c.until_time(), None);
        // Timing reset: next tick is a bootstrap tick again.
        let range = c.next_range_millis(9999.0);
        assert!((range - 20.0).abs() < 1e-9);
    }

    #[test]
    fn complete_seek_clears_only_the_matching_target() {
        let c = controller();
        c.seek_playback(t(150));
        // A newer seek supersedes the in-flight backfill.
        c.seek_playback(t(170));
        assert!(!c.complete_seek(t(150)));
        assert_eq!(c.seek_target(), Some(t(170)));
        assert!(c.complete_seek(t(170)));
        assert_eq!(c.seek_target(), None);
        assert_eq!(c.last_seek_time(), 1);
    }

    #[test]
    fn start_playback_is_idempotent() {
        let c = controller();
        assert!(c.start_playback());
        assert!(!c.start_playback());
    }

    #[test]
    fn play_until_requires_a_future_target() {
        let c = controller();
        c.set_current_time(t(150));
        let err = c.play_until(t(150)).unwrap_err();
        assert!(matches!(err, PlaybackError::Precondition(_)));
        assert!(!c.is_playing());
    }

    #[test]
    fn play_until_clamps_and_starts() {
        let c = controller();
        assert!(c.play_until(t(500)).unwrap());
        assert_eq!(c.until_time(), Some(t(200)));
        assert!(c.is_playing());
    }

    #[test]
    fn pause_clears_until_and_timing() {
        let c = controller();
        c.play_until(t(180)).unwrap();
        c.next_range_millis(1000.0);
        assert!(c.pause_playback());
        assert!(!c.is_playing());
        assert_eq!(c.until_time(), None);
        let range = c.next_range_millis(5000.0);
        assert!((range - 20.0).abs() < 1e-9);
    }

    #[test]
    fn nonpositive_speed_is_rejected_and_prior_kept() {
        let c = controller();
        c.set_speed(2.5).unwrap();
        assert!(c.set_speed(0.0).is_err());
        assert!(c.set_speed(-1.0).is_err());
        assert!((c.speed() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn tick_end_time_honors_until_time() {
        let c = controller();
        c.set_current_time(t(150));
        c.play_until(t(151)).unwrap();
        let end = c.tick_end_time(5000.0);
        assert_eq!(end, t(151));
    }
}
