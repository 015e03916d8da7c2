//! 故障恢复：受管组件注册表、瞬时缓冲跟踪、有界重试与整体重启

pub mod component;
pub mod coordinator;
pub mod memory;

pub use component::{
    ComponentCategory, ComponentRegistry, ManagedComponent, PolicyComponent, StartupTier,
};
pub use coordinator::{
    RecoveryAttemptRecord, RecoveryCause, RecoveryCoordinator, RecoveryOutcome, RefusalReason,
};
pub use memory::{BufferLease, BufferTracker};
