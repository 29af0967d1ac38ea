//! Playback speed correction
//!
//! Buffered depth is the distance between the sender position at the end of the frame just
//! written and the sink's played position, both measured from the base remote count taken
//! at playback start. Depth above target plus threshold speeds playback up, depth below
//! target minus threshold slows it down.

use std::time::{Duration, Instant};

use crate::config::DriftConfig;

#[derive(Debug)]
pub struct DriftController {
    config: DriftConfig,
    enabled: bool,
    samples_per_frame: i64,
    target: i64,
    threshold: i64,
    /// Remote count that lines up with played position zero
    base: i64,
    last_remote: Option<u64>,
    last_depth: i64,
    speed: f32,
    last_change: Option<Instant>,
    changes: u64,
}

impl DriftController {
    pub fn new(config: DriftConfig, prefill_frames: usize, samples_per_frame: usize) -> Self {
        let samples_per_frame = samples_per_frame as i64;
        Self {
            enabled: prefill_frames >= config.min_prefill_frames,
            target: prefill_frames as i64 * samples_per_frame,
            threshold: config.threshold_frames as i64 * samples_per_frame,
            samples_per_frame,
            config,
            base: 0,
            last_remote: None,
            last_depth: 0,
            speed: 1.0,
            last_change: None,
            changes: 0,
        }
    }

    /// Anchor the first frame handed to the sink
    pub fn reset(&mut self, base_remote: u64) {
        self.base = base_remote as i64;
        self.last_remote = None;
        self.last_depth = 0;
        self.speed = 1.0;
        self.last_change = None;
    }

    /// Speed up when too deep, slow down when too shallow, unity otherwise
    pub fn desired_speed(&self, depth: i64) -> f32 {
        if !self.enabled {
            return 1.0;
        }
        let error = depth - self.target;
        if error > self.threshold {
            self.config.speed_up
        } else if error < -self.threshold {
            self.config.slow_down
        } else {
            1.0
        }
    }

    /// Record the frame just written; returns a new speed when one should be applied
    pub fn observe(&mut self, frame_remote: u64, played: u64, now: Instant) -> Option<f32> {
        let end = frame_remote as i64 + self.samples_per_frame;
        if self.last_remote.is_some_and(|last| frame_remote < last) {
            // sender restarted its counter; keep depth continuous across the jump
            self.base = end - played as i64 - self.last_depth;
            tracing::debug!("Remote counter regressed to {}, rebased", frame_remote);
        }
        self.last_remote = Some(frame_remote);

        let depth = end - self.base - played as i64;
        self.last_depth = depth;

        let desired = self.desired_speed(depth);
        if (desired - self.speed).abs() < f32::EPSILON {
            return None;
        }
        let interval = Duration::from_millis(self.config.min_change_interval_ms);
        if self
            .last_change
            .is_some_and(|at| now.saturating_duration_since(at) < interval)
        {
            return None;
        }

        self.speed = desired;
        self.last_change = Some(now);
        self.changes += 1;
        Some(desired)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    /// Depth computed by the last observation, in per-channel samples
    pub fn depth(&self) -> i64 {
        self.last_depth
    }

    pub fn target(&self) -> i64 {
        self.target
    }

    pub fn speed_changes(&self) -> u64 {
        self.changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPF: u64 = 480;

    fn controller(prefill: usize) -> DriftController {
        let mut drift = DriftController::new(DriftConfig::default(), prefill, SPF as usize);
        drift.reset(0);
        drift
    }

    #[test]
    fn test_direction() {
        let drift = controller(6);
        let target = drift.target();
        let threshold = 4 * SPF as i64;
        assert_eq!(drift.desired_speed(target + threshold + 1), 1.005);
        assert_eq!(drift.desired_speed(target - threshold - 1), 0.995);
        assert_eq!(drift.desired_speed(target), 1.0);
        assert_eq!(drift.desired_speed(target + threshold), 1.0);
        assert_eq!(drift.desired_speed(target - threshold), 1.0);
    }

    #[test]
    fn test_disabled_for_tiny_prefill() {
        let mut drift = controller(2);
        assert!(!drift.is_enabled());
        assert_eq!(drift.desired_speed(1_000_000), 1.0);
        assert_eq!(drift.observe(100 * SPF, 0, Instant::now()), None);
    }

    #[test]
    fn test_arrivals_faster_than_playback_speed_up() {
        let mut drift = controller(6);
        let start = Instant::now();
        // 20 frames written while the sink has played only 6
        let speed = drift.observe(19 * SPF, 6 * SPF, start);
        assert_eq!(speed, Some(1.005));
        assert_eq!(drift.depth(), 14 * SPF as i64);
    }

    #[test]
    fn test_arrivals_slower_than_playback_slow_down() {
        let mut drift = controller(6);
        // only the first frame is in while the sink already consumed it
        let speed = drift.observe(0, SPF, Instant::now());
        assert_eq!(speed, Some(0.995));
    }

    #[test]
    fn test_hysteresis() {
        let mut drift = controller(6);
        let t0 = Instant::now();
        assert_eq!(drift.observe(19 * SPF, 0, t0), Some(1.005));
        // back in band 100 ms later: held
        assert_eq!(drift.observe(19 * SPF, 14 * SPF, t0 + Duration::from_millis(100)), None);
        assert_eq!(drift.speed(), 1.005);
        // allowed once the interval has passed
        assert_eq!(drift.observe(19 * SPF, 14 * SPF, t0 + Duration::from_millis(260)), Some(1.0));
        assert_eq!(drift.speed_changes(), 2);
    }

    #[test]
    fn test_regression_rebases() {
        let mut drift = controller(6);
        let t0 = Instant::now();
        drift.observe(1_000 * SPF, 995 * SPF, t0);
        let before = drift.depth();

        // sender restarted at zero; depth carries over instead of going negative
        let speed = drift.observe(0, 996 * SPF, t0 + Duration::from_millis(10));
        assert_eq!(drift.depth(), before);
        assert_eq!(speed, None);

        drift.observe(SPF, 997 * SPF, t0 + Duration::from_millis(20));
        assert_eq!(drift.depth(), before);
    }
}
