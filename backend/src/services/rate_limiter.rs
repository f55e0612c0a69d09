use log::{info, warn};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of asking the controller for a dispatch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Burst budget for the current window is spent; retry after the delay.
    Delayed(Duration),
    /// Pipeline-wide cooldown after a provider ban signal.
    Paused { until: Instant },
}

/// Rate-limiter bookkeeping: dispatch window plus ban cooldown.
#[derive(Debug)]
struct CrawlWindowState {
    window_start: Instant,
    dispatched_in_window: u32,
    paused_until: Option<Instant>,
    /// Cooldown applied on the most recent ban signal. Grows with each
    /// consecutive signal and is not reset by resuming.
    cooldown: Duration,
    ban_signals: u32,
}

/// Enforces the crawl burst ceiling per dispatch window and the
/// exponentially growing pipeline pause on provider throttle/ban signals.
/// This is the safety-critical path: when in doubt it under-dispatches.
pub struct RateLimiter {
    burst_max: u32,
    window: Duration,
    cooldown_base: Duration,
    cooldown_cap: Duration,
    state: Mutex<CrawlWindowState>,
}

impl RateLimiter {
    pub fn new(
        burst_max: u32,
        window: Duration,
        cooldown_base: Duration,
        cooldown_cap: Duration,
    ) -> Self {
        RateLimiter {
            burst_max: burst_max.max(1),
            window,
            cooldown_base,
            cooldown_cap,
            state: Mutex::new(CrawlWindowState {
                window_start: Instant::now(),
                dispatched_in_window: 0,
                paused_until: None,
                cooldown: cooldown_base,
                ban_signals: 0,
            }),
        }
    }

    pub fn admit(&self) -> Admission {
        self.admit_at(Instant::now())
    }

    fn admit_at(&self, now: Instant) -> Admission {
        let mut state = self.state.lock().unwrap();

        if let Some(until) = state.paused_until {
            if now < until {
                return Admission::Paused { until };
            }
            // Cooldown elapsed; resume with a fresh window but keep the
            // grown cooldown so a repeat ban pauses for longer.
            info!("Crawl cooldown elapsed, resuming dispatch");
            state.paused_until = None;
            state.window_start = now;
            state.dispatched_in_window = 0;
        }

        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.dispatched_in_window = 0;
        }

        if state.dispatched_in_window < self.burst_max {
            state.dispatched_in_window += 1;
            Admission::Granted
        } else {
            let next_window = state.window_start + self.window;
            Admission::Delayed(next_window.saturating_duration_since(now))
        }
    }

    /// A 429/403-class response was observed. Enter (or extend) the paused
    /// state; consecutive signals double the cooldown up to the cap.
    pub fn record_ban_signal(&self) {
        self.record_ban_signal_at(Instant::now());
    }

    fn record_ban_signal_at(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();
        if state.ban_signals > 0 {
            state.cooldown = (state.cooldown * 2).min(self.cooldown_cap);
        } else {
            state.cooldown = self.cooldown_base;
        }
        state.ban_signals += 1;
        state.paused_until = Some(now + state.cooldown);
        warn!(
            "Provider ban signal #{}: pausing crawl pipeline for {:?}",
            state.ban_signals, state.cooldown
        );
    }

    /// Operator override: lift the pause immediately. The cooldown
    /// multiplier keeps its value so repeated bans cannot flap.
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if state.paused_until.take().is_some() {
            info!("Crawl pipeline resumed by operator override");
        }
    }

    pub fn is_paused(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .paused_until
            .is_some_and(|until| Instant::now() < until)
    }

    pub fn current_cooldown(&self) -> Duration {
        self.state.lock().unwrap().cooldown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(burst: u32) -> RateLimiter {
        RateLimiter::new(
            burst,
            Duration::from_secs(30),
            Duration::from_secs(300),
            Duration::from_secs(14400),
        )
    }

    #[test]
    fn burst_of_one_admits_one_per_window() {
        let limiter = limiter(1);
        let now = Instant::now();

        assert_eq!(limiter.admit_at(now), Admission::Granted);
        match limiter.admit_at(now + Duration::from_secs(1)) {
            Admission::Delayed(delay) => {
                assert!(delay > Duration::from_secs(28) && delay <= Duration::from_secs(30))
            }
            other => panic!("expected delay, got {other:?}"),
        }

        // Next window rolls the counter over.
        assert_eq!(
            limiter.admit_at(now + Duration::from_secs(31)),
            Admission::Granted
        );
    }

    #[test]
    fn ban_signal_pauses_all_admissions_until_cooldown_elapses() {
        let limiter = limiter(5);
        let now = Instant::now();

        limiter.record_ban_signal_at(now);
        assert!(matches!(
            limiter.admit_at(now + Duration::from_secs(299)),
            Admission::Paused { .. }
        ));
        assert_eq!(
            limiter.admit_at(now + Duration::from_secs(301)),
            Admission::Granted
        );
    }

    #[test]
    fn consecutive_ban_signals_grow_the_cooldown() {
        let limiter = limiter(1);
        let now = Instant::now();

        limiter.record_ban_signal_at(now);
        let first = limiter.current_cooldown();
        limiter.record_ban_signal_at(now + Duration::from_secs(400));
        let second = limiter.current_cooldown();

        assert_eq!(first, Duration::from_secs(300));
        assert_eq!(second, Duration::from_secs(600));
        assert!(second > first);
    }

    #[test]
    fn cooldown_is_capped() {
        let limiter = RateLimiter::new(
            1,
            Duration::from_secs(30),
            Duration::from_secs(300),
            Duration::from_secs(1200),
        );
        let now = Instant::now();
        for i in 0..10 {
            limiter.record_ban_signal_at(now + Duration::from_secs(i));
        }
        assert_eq!(limiter.current_cooldown(), Duration::from_secs(1200));
    }

    #[test]
    fn operator_resume_lifts_pause_but_keeps_multiplier() {
        let limiter = limiter(1);
        let now = Instant::now();

        limiter.record_ban_signal_at(now);
        limiter.record_ban_signal_at(now);
        limiter.resume();
        assert_eq!(limiter.admit_at(now + Duration::from_secs(1)), Admission::Granted);

        // The next ban doubles from the grown value, not from the base.
        limiter.record_ban_signal_at(now);
        assert_eq!(limiter.current_cooldown(), Duration::from_secs(1200));
    }
}
