//! Capture rate limiting.

use std::time::{Duration, Instant};

/// Caps the capture rate of one stream.
///
/// The interval is measured from the previous capture, and only the remaining
/// part of it is slept. A slow iteration is not compensated by a shorter one
/// afterwards.
pub struct FramePacer {
    min_delay: Option<Duration>,
    prev_capture: Instant,
}

impl FramePacer {
    /// `fps_limit <= 0` disables pacing.
    pub fn new(fps_limit: f64) -> Self {
        let min_delay = (fps_limit > 0.0 && fps_limit.is_finite())
            .then(|| Duration::from_secs_f64(1.0 / fps_limit));
        Self {
            min_delay,
            prev_capture: Instant::now(),
        }
    }

    pub fn min_delay(&self) -> Option<Duration> {
        self.min_delay
    }

    /// Time left to wait at `now`.
    pub fn residual(&self, now: Instant) -> Duration {
        match self.min_delay {
            Some(delay) => delay.saturating_sub(now.saturating_duration_since(self.prev_capture)),
            None => Duration::ZERO,
        }
    }

    /// Sleep out the residual and start the next interval.
    pub fn wait(&mut self) {
        if self.min_delay.is_none() {
            return;
        }
        let residual = self.residual(Instant::now());
        if !residual.is_zero() {
            std::thread::sleep(residual);
        }
        self.prev_capture = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_25_gives_40ms() {
        let pacer = FramePacer::new(25.0);
        assert_eq!(pacer.min_delay(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_slow_iteration_sleeps_zero() {
        let pacer = FramePacer::new(25.0);
        let now = pacer.prev_capture + Duration::from_millis(45);
        assert_eq!(pacer.residual(now), Duration::ZERO);
    }

    #[test]
    fn test_fast_iteration_sleeps_remainder() {
        let pacer = FramePacer::new(25.0);
        let now = pacer.prev_capture + Duration::from_millis(15);
        assert_eq!(pacer.residual(now), Duration::from_millis(25));
    }

    #[test]
    fn test_no_limit() {
        for fps in [0.0, -5.0, f64::NAN] {
            let pacer = FramePacer::new(fps);
            assert!(pacer.min_delay().is_none());
            assert_eq!(pacer.residual(Instant::now()), Duration::ZERO);
        }
    }

    #[test]
    fn test_wait_restarts_interval() {
        let mut pacer = FramePacer::new(200.0);
        let before = Instant::now();
        pacer.wait();
        assert!(pacer.prev_capture >= before);
        assert!(pacer.residual(pacer.prev_capture) <= Duration::from_millis(5));
    }
}
