// Order execution: position cache and the order engine.

pub mod engine;
pub mod position_cache;

pub use engine::{plan_order, ExecutionEngine, OrderPlan};
pub use position_cache::PositionCache;
