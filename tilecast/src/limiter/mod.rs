//! Rate limiting for the client edge and the upstream backend.
//!
//! Two independent layers:
//!
//! - The **edge limiter** runs before any key-space work: a token bucket per
//!   client identity, persisted in the MetaStore so the whole fleet shares
//!   one budget, with an in-process fallback when the store is down.
//! - The **upstream gate** protects the Earth-imagery backend: a concurrency
//!   semaphore, minimum request spacing, and a failure-driven circuit
//!   breaker that short-circuits calls while the upstream is rejecting work.

mod breaker;
mod edge;
mod gate;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use edge::{EdgeDecision, EdgeLimiter, EdgeLimiterConfig};
pub use gate::{GateError, UpstreamGate, UpstreamGateConfig, UpstreamPermit};
