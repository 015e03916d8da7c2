//! 健康监控与全局熔断

pub mod breaker;
pub mod monitor;

pub use breaker::{BreakerState, CircuitBreaker};
pub use monitor::{HealthListener, HealthMonitor, HealthStatus, ProbeResult, ServiceHealthRecord};
