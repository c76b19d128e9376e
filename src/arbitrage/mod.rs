pub mod calculator;
pub mod cooldown;
pub mod engine;

pub use calculator::SpreadCalculator;
pub use cooldown::AlertCooldown;
pub use engine::{EngineStats, MonitorEngine};
