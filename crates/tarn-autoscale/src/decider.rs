//! Scaling decider — hysteresis thresholds plus a cooldown window.

use std::time::Duration;

use tarn_core::{ConfigResult, TarnConfig};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    pub up_threshold: f64,
    pub down_threshold: f64,
    pub min: u32,
    pub max: u32,
    pub cooldown: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            up_threshold: 0.7,
            down_threshold: 0.2,
            min: 1,
            max: 10,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl ScalingPolicy {
    pub fn from_config(config: &TarnConfig) -> ConfigResult<Self> {
        Ok(Self {
            up_threshold: config.scaling.up_threshold,
            down_threshold: config.scaling.down_threshold,
            min: config.scaling.min_replicas,
            max: config.scaling.max_replicas,
            cooldown: config.cooldown()?,
        })
    }

    pub fn clamp(&self, target: u32) -> u32 {
        target.clamp(self.min, self.max.max(self.min))
    }
}

/// Applies a [`ScalingPolicy`], remembering when the target last changed.
#[derive(Debug, Clone)]
pub struct ScalingDecider {
    policy: ScalingPolicy,
    last_change: Option<Instant>,
}

impl ScalingDecider {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            last_change: None,
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn last_change(&self) -> Option<Instant> {
        self.last_change
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.last_change
            .is_some_and(|at| now.saturating_duration_since(at) < self.policy.cooldown)
    }

    /// New target for `current` given `load`. Moves by at most one and
    /// never leaves `[min, max]`; only an actual change starts a cooldown.
    pub fn decide(&mut self, current: u32, load: f64, now: Instant) -> u32 {
        let current = self.policy.clamp(current);
        if self.in_cooldown(now) {
            debug!(replicas = current, load, "scaling in cooldown");
            return current;
        }

        let p = &self.policy;
        let next = if load > p.up_threshold && current < p.max {
            info!(load, from = current, to = current + 1, "high load, scaling up");
            current + 1
        } else if load < p.down_threshold && current > p.min {
            info!(load, from = current, to = current - 1, "low load, scaling down");
            current - 1
        } else {
            current
        };

        if next != current {
            self.last_change = Some(now);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy(cooldown_secs: u64) -> ScalingPolicy {
        ScalingPolicy {
            up_threshold: 0.7,
            down_threshold: 0.2,
            min: 1,
            max: 10,
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }

    #[test]
    fn scales_up_one_step_above_threshold() {
        let mut decider = ScalingDecider::new(test_policy(0));
        let now = Instant::now();
        assert_eq!(decider.decide(1, 0.8, now), 2);
        assert_eq!(decider.decide(2, 1.0, now), 3);
    }

    #[test]
    fn scales_down_one_step_below_threshold() {
        let mut decider = ScalingDecider::new(test_policy(0));
        assert_eq!(decider.decide(5, 0.0, Instant::now()), 4);
    }

    #[test]
    fn holds_between_thresholds_and_at_boundaries() {
        let mut decider = ScalingDecider::new(test_policy(0));
        let now = Instant::now();
        assert_eq!(decider.decide(3, 0.5, now), 3);
        assert_eq!(decider.decide(3, 0.7, now), 3);
        assert_eq!(decider.decide(3, 0.2, now), 3);
        assert!(decider.last_change().is_none());
    }

    #[test]
    fn respects_min_and_max() {
        let mut decider = ScalingDecider::new(test_policy(0));
        let now = Instant::now();
        assert_eq!(decider.decide(10, 0.99, now), 10);
        assert_eq!(decider.decide(1, 0.01, now), 1);
        // Out-of-range input is pulled back inside the bounds.
        assert_eq!(decider.decide(25, 0.5, now), 10);
        assert_eq!(decider.decide(0, 0.5, now), 1);
    }

    #[test]
    fn never_leaves_bounds_over_a_sweep() {
        let policy = ScalingPolicy {
            min: 2,
            max: 4,
            ..test_policy(0)
        };
        let mut decider = ScalingDecider::new(policy);
        let now = Instant::now();
        for current in 0..8 {
            for load in [0.0, 0.1, 0.2, 0.5, 0.7, 0.9, 1.0] {
                let next = decider.decide(current, load, now);
                assert!((2..=4).contains(&next), "decide({current}, {load}) = {next}");
                assert!(next.abs_diff(policy.clamp(current)) <= 1);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_is_absolute() {
        let mut decider = ScalingDecider::new(test_policy(60));
        assert_eq!(decider.decide(1, 0.9, Instant::now()), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(decider.decide(2, 0.99, Instant::now()), 2);
        assert_eq!(decider.decide(2, 0.0, Instant::now()), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(decider.decide(2, 0.99, Instant::now()), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn no_change_does_not_start_cooldown() {
        let mut decider = ScalingDecider::new(test_policy(60));
        assert_eq!(decider.decide(3, 0.5, Instant::now()), 3);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(decider.decide(3, 0.9, Instant::now()), 4);
    }

    #[test]
    fn policy_from_config() {
        let mut config = TarnConfig::default();
        config.scaling.cooldown = "90s".to_string();
        config.scaling.max_replicas = 4;
        let policy = ScalingPolicy::from_config(&config).unwrap();
        assert_eq!(policy.cooldown, Duration::from_secs(90));
        assert_eq!(policy.max, 4);
        assert_eq!(policy.up_threshold, 0.7);
    }
}
