//! GamePilot 演示入口
//!
//! 用模拟的帧来源、检测器与执行器跑完整管线：采集 → 检测 → 融合决策 → 执行 → 在线学习，
//! 健康监控与恢复在后台运行。运行到配置的时长或 Ctrl+C 后优雅关闭。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gamepilot::config::load_config;
use gamepilot::core::{run_with_graceful_shutdown, PilotBuilder, ShutdownManager, ShutdownReason};
use gamepilot::observability;
use gamepilot::perception::{LoggingActuator, ScriptedDetector, SyntheticCapture};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(Into::into);
    let config = load_config(config_path).context("Failed to load configuration")?;
    let run_for = config.app.run_for_secs.map(Duration::from_secs);
    tracing::info!(
        "Starting {}",
        config.app.name.as_deref().unwrap_or("gamepilot")
    );

    let shutdown = Arc::new(ShutdownManager::new());
    let actuator = Arc::new(LoggingActuator::new());
    let ctx = Arc::new(
        PilotBuilder::new(config)
            .with_capture(Arc::new(SyntheticCapture::default().with_failures(500)))
            .with_detector(Arc::new(ScriptedDetector::new().with_failures(50)))
            .with_actuator(actuator.clone())
            .with_default_policies()
            .with_shutdown_manager(shutdown.clone())
            .build()
            .await
            .context("Failed to build pipeline")?,
    );
    ctx.start().await.context("Failed to start pipeline")?;

    let app = async {
        match run_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    let cleanup_ctx = ctx.clone();
    run_with_graceful_shutdown(shutdown, app, || async move {
        cleanup_ctx.shutdown(ShutdownReason::RunCompleted).await;
    })
    .await;

    let stats = ctx.stats();
    tracing::info!(
        "Run finished: {} frames accepted, {} dropped, {} decisions ({} degraded), {} learning runs, reward {:.2}",
        stats.frames_accepted,
        stats.frames_dropped,
        stats.decisions_published,
        stats.decisions_degraded,
        stats.learning_runs,
        stats.cumulative_reward
    );
    tracing::info!("Actions executed: {}", actuator.executed().await.len());
    Ok(())
}
