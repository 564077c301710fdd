//! tarn-autoscale — load-driven replica count decisions.
//!
//! # Scaling Algorithm
//!
//! ```text
//! if now - last_change < cooldown:
//!     keep current target
//! elif load > up_threshold and target < max:
//!     target + 1
//! elif load < down_threshold and target > min:
//!     target - 1
//! else:
//!     keep current target
//! ```
//!
//! The step is always one replica. Combined with the cooldown this bounds
//! the rate of change to one replica per cooldown interval no matter how
//! far load strays from the thresholds.
//!
//! Replacing a crashed replica is not scaling: the controller re-requests
//! it without consulting the decider, so failover is never throttled.

pub mod decider;

pub use decider::{ScalingDecider, ScalingPolicy};
