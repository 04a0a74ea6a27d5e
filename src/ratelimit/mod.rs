//! Fixed-window throttling: keys, windows, limit policy and the engine.

mod engine;
mod key;
mod policy;
mod window;

pub use engine::{EngineStats, ThrottleEngine, ThrottleResult, DEFAULT_STORE_TIMEOUT};
pub use key::{store_key, ThrottleKey, TIER_NAMESPACE};
pub use policy::{LimitRule, Operation, Principal, RateLimitPolicy};
pub use window::FixedWindow;
