//! Rate limiting logic and admission control.

mod block;
mod engine;
mod policy;

pub use block::BlockManager;
pub use engine::{CheckResult, RateLimiter};
pub use policy::{PolicyRegistry, RateLimitPolicy};
