//! tarn-health — resilience primitives for the replica-set controller.
//!
//! Everything the controller does across a process boundary (asking the
//! cluster allocator for containers, launching them, probing replicas)
//! runs through the types in this crate.
//!
//! # Architecture
//!
//! ```text
//! RetryExecutor ── bounded attempts, exponential backoff, cancellable
//!       │
//!       ▼
//! CircuitBreaker (one per dependency, held in a BreakerRegistry)
//!   Closed ──failures ≥ threshold──▶ Open
//!     ▲                               │ reset_timeout elapsed
//!     └──── success ──── HalfOpen ◀───┘
//!                          │ failure
//!                          └────────▶ Open
//!       │
//!       ▼
//! ReplicaProbe (HttpProbe): GET readiness path, GET metrics path
//! ```
//!
//! Breakers never raise on rejection: `execute` hands back the caller's
//! fallback so one unreachable replica degrades to "no load" instead of
//! aborting a reconcile tick.

pub mod breaker;
pub mod probe;
pub mod retry;

pub use breaker::{BreakerRegistry, BreakerSettings, BreakerSnapshot, BreakerState, CallError, CircuitBreaker};
pub use probe::{HttpProbe, ProbeError, ProbeResult, ReplicaProbe};
pub use retry::{RetryError, RetryExecutor, RetryPolicy};
