//! 核心层：错误分类、共享状态、阶段调度、会话监管、构建与关闭

pub mod builder;
pub mod error;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use builder::{PilotBuilder, PilotContext};
pub use error::{ErrorClass, PilotError};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{
    run_with_graceful_shutdown, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
pub use state::{
    derive_features, BoundingBox, DetectedEntity, FeatureVector, GameState, SharedGameState,
    FEATURE_LEN,
};
pub use task_scheduler::{StagePermit, TaskKind, TaskScheduler};
