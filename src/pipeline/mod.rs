//! 帧 → 状态 → 决策 → 学习 的异步管线
//!
//! - **frame**: 视觉阶段，单飞，忙时丢帧
//! - **decision**: 决策融合，单飞，超时降级
//! - **learning**: 奖励塑形与有界并发的在线训练
//! - **events**: 管线回调
//! - **stats**: 运行计数

pub mod decision;
pub mod events;
pub mod frame;
pub mod learning;
pub mod stats;

pub use decision::{Decision, DecisionSynchronizer};
pub use events::{Listeners, PipelineEvent, PipelineListener, RecordingListener};
pub use frame::{FramePipeline, FrameRejected, DETECTOR_SERVICE, MEMORY_SERVICE};
pub use learning::{LearningLoop, LearningReport, RewardShaping};
pub use stats::{PipelineStats, StatsSnapshot};
