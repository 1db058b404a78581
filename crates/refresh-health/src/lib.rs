//! refresh-health: health verdicts for units and applications.
//!
//! A unit must prove it is healthy on every version it runs. The
//! aggregator asks a workload-supplied probe, stores the verdict on the
//! unit, and answers whether the application as a whole is healthy.
//!
//! # Architecture
//!
//! ```text
//! HealthAggregator
//!   ├── HealthProbe (trait)
//!   │   ├── HttpProbe   → http_probe() against {ordinal}-templated address
//!   │   └── StaticProbe → verdicts set by hand (tests, dry runs)
//!   └── UnitState.healthy in StateStore
//! ```
//!
//! A probe that cannot determine health (`ProbeResult::Failed`) counts as
//! unhealthy: the rollout pauses rather than proceeding on uncertainty.

pub mod aggregator;
pub mod probe;

pub use aggregator::{HealthAggregator, HealthError, HealthResult};
pub use probe::{HealthProbe, HttpProbe, ProbeFuture, ProbeResult, StaticProbe, http_probe};
