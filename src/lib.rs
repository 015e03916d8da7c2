//! GamePilot - 视觉驱动的游戏自动化核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、共享状态、阶段调度、会话监管、构建与优雅关闭
//! - **bus**: 带去重窗口的有序消息总线
//! - **perception**: 帧来源 / 检测器 / 执行器 trait、采集循环与模拟实现
//! - **policy**: 动作空间、策略 trait、启发式与学习策略、融合规则
//! - **pipeline**: 帧处理、决策同步、在线学习
//! - **health**: 健康状态机、周期探测、全局熔断
//! - **recovery**: 受管组件注册表、缓冲跟踪、有界重试与整体重启
//! - **observability**: 日志初始化

pub mod bus;
pub mod config;
pub mod core;
pub mod health;
pub mod observability;
pub mod perception;
pub mod pipeline;
pub mod policy;
pub mod recovery;

pub use crate::core::{PilotBuilder, PilotContext, PilotError};
