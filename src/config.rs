//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `GAMEPILOT__*` 覆盖（双下划线表示嵌套，如 `GAMEPILOT__DECISION__CONFIDENCE_FLOOR=0.4`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub pipeline: PipelineSection,
    pub decision: DecisionSection,
    pub learning: LearningSection,
    pub health: HealthSection,
    pub recovery: RecoverySection,
    pub bus: BusSection,
}

/// [app] 段：名称、演示运行时长、关闭超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 未设置时一直运行直到 Ctrl+C
    pub run_for_secs: Option<u64>,
    pub shutdown_timeout_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            run_for_secs: None,
            shutdown_timeout_secs: 5,
        }
    }
}

/// [pipeline] 段：采集节奏、采集会话时长、瞬时缓冲内存预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub frame_interval_ms: u64,
    pub capture_session_secs: Option<u64>,
    pub memory_limit_bytes: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            frame_interval_ms: 33,
            capture_session_secs: None,
            memory_limit_bytes: 64 * 1024 * 1024,
        }
    }
}

impl PipelineSection {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

/// [decision] 段：融合置信度下限、决策超时、学习开关与学习并发
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecisionSection {
    /// 两个学习策略的置信度都低于该值时由启发式策略接管
    pub confidence_floor: f32,
    pub decision_timeout_ms: u64,
    pub learning_enabled: bool,
    pub learning_workers: usize,
}

impl Default for DecisionSection {
    fn default() -> Self {
        Self {
            confidence_floor: 0.3,
            decision_timeout_ms: 500,
            learning_enabled: true,
            learning_workers: 2,
        }
    }
}

impl DecisionSection {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }
}

/// [learning] 段：奖励塑形参数与学习超参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LearningSection {
    pub base_reward: f32,
    pub entity_bonus: f32,
    pub latency_penalty: f32,
    pub latency_threshold_ms: i64,
    pub learning_rate: f32,
    pub discount: f32,
}

impl Default for LearningSection {
    fn default() -> Self {
        Self {
            base_reward: 0.1,
            entity_bonus: 0.2,
            latency_penalty: 0.1,
            latency_threshold_ms: 1000,
            learning_rate: 0.05,
            discount: 0.9,
        }
    }
}

/// [health] 段：探测周期、防探测风暴、全局熔断
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub probe_interval_ms: u64,
    pub min_probe_interval_ms: u64,
    pub max_probe_depth: u32,
    pub probe_timeout_ms: u64,
    /// 累计多少次问题上报后从 DEGRADED 升级为 FAILED
    pub failed_after_issues: u32,
    pub breaker_threshold: usize,
    pub breaker_window_secs: u64,
    pub breaker_cooldown_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5000,
            min_probe_interval_ms: 1000,
            max_probe_depth: 2,
            probe_timeout_ms: 2000,
            failed_after_issues: 3,
            breaker_threshold: 3,
            breaker_window_secs: 30,
            breaker_cooldown_secs: 30,
        }
    }
}

impl HealthSection {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn min_probe_interval(&self) -> Duration {
        Duration::from_millis(self.min_probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn breaker_window(&self) -> Duration {
        Duration::from_secs(self.breaker_window_secs)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

/// [recovery] 段：重试上限、冷却窗口、重启延迟与升级阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_attempts: u32,
    pub cooldown_secs: u64,
    pub restart_delay_ms: u64,
    pub stabilization_delay_ms: u64,
    /// 恢复预算耗尽的组件数达到该值时执行整体重启
    pub escalation_threshold: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown_secs: 30,
            restart_delay_ms: 1000,
            stabilization_delay_ms: 2000,
            escalation_threshold: 2,
        }
    }
}

impl RecoverySection {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }
}

/// [bus] 段：去重窗口与出队间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub dedup_window_ms: u64,
    pub inter_message_pause_ms: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            dedup_window_ms: 100,
            inter_message_pause_ms: 5,
        }
    }
}

impl BusSection {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn inter_message_pause(&self) -> Duration {
        Duration::from_millis(self.inter_message_pause_ms)
    }
}

/// 从 config 目录加载配置，环境变量 GAMEPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 GAMEPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("GAMEPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.recovery.max_attempts, 3);
        assert_eq!(cfg.recovery.cooldown(), Duration::from_secs(30));
        assert_eq!(cfg.health.breaker_threshold, 3);
        assert_eq!(cfg.bus.dedup_window(), Duration::from_millis(100));
        assert_eq!(cfg.learning.latency_threshold_ms, 1000);
    }

    #[test]
    fn test_load_config_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[decision]\nconfidence_floor = 0.45\n\n[recovery]\nmax_attempts = 5"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert!((cfg.decision.confidence_floor - 0.45).abs() < f32::EPSILON);
        assert_eq!(cfg.recovery.max_attempts, 5);
        // 未覆盖的键保持默认
        assert_eq!(cfg.recovery.cooldown_secs, 30);
        assert!(cfg.decision.learning_enabled);
    }
}
