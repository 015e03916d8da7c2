//! 错误类型与错误分级
//!
//! 每个阶段自行捕获错误、记录日志并通过回调上报；ErrorClass 决定上报后由谁处理
//! （丢弃等待下一帧 / 组件恢复 / 强制清理 / 熔断与整体重启）。

use thiserror::Error;

/// 运行过程中可能出现的错误（感知、策略、执行器、资源、组件、配置等）
#[derive(Error, Debug, Clone)]
pub enum PilotError {
    #[error("Components not registered yet")]
    NotReady,

    #[error("Components already registered")]
    AlreadyRegistered,

    #[error("Detection failed: {0}")]
    DetectionFailed(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Policy '{policy}' failed: {reason}")]
    PolicyFailed { policy: String, reason: String },

    #[error("Actuator failed: {0}")]
    ActuatorFailed(String),

    #[error("Decision timed out after {0} ms")]
    DecisionTimeout(u64),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Component '{component}' failed: {reason}")]
    ComponentFailed { component: String, reason: String },

    #[error("Recovery refused for '{0}'")]
    RecoveryRefused(String),

    /// 多个组件同时故障，需要熔断并整体重启
    #[error("Cascading failure: {0}")]
    Cascading(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

/// 错误分级：决定错误被上报之后的处理路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 单次失败，丢弃，下一帧自然重试
    Transient,
    /// 组件反复失败但仍在重试预算内，交给 RecoveryCoordinator
    RecoverableComponent,
    /// 内存压力：强制清理并降级分配
    ResourceExhaustion,
    /// 故障在多个组件间聚集：熔断并整体重启
    Catastrophic,
}

impl PilotError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PilotError::DetectionFailed(_)
            | PilotError::CaptureFailed(_)
            | PilotError::ActuatorFailed(_)
            | PilotError::DecisionTimeout(_)
            | PilotError::NotReady
            | PilotError::AlreadyRegistered
            | PilotError::ConfigError(_) => ErrorClass::Transient,
            PilotError::PolicyFailed { .. }
            | PilotError::ComponentFailed { .. }
            | PilotError::RecoveryRefused(_) => ErrorClass::RecoverableComponent,
            PilotError::ResourceExhausted(_) => ErrorClass::ResourceExhaustion,
            PilotError::Cascading(_) => ErrorClass::Catastrophic,
        }
    }

    pub fn policy(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        PilotError::PolicyFailed {
            policy: policy.into(),
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for PilotError {
    fn from(e: config::ConfigError) -> Self {
        PilotError::ConfigError(e.to_string())
    }
}
