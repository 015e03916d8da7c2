//! 受管组件与编译期组件注册表
//!
//! 所有可被停止、重启、释放的组件实现 ManagedComponent；ComponentRegistry 在启动时按名登记，
//! 恢复与整体重启只通过注册表查找，不存在按字符串动态加载的路径。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::GameState;
use crate::policy::{ModelProfile, Policy};

/// 组件类别，决定恢复动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentCategory {
    /// 停止 → 等待 → 重启
    Service,
    /// 释放 → 以降级规格重新初始化
    Model,
    /// 轻量往返测试通过后才算恢复
    Persistence,
}

/// 整体重启时的启动顺序：支撑与管理组件 → 采集 → 需要用户手动启用的组件
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StartupTier {
    Support,
    Capture,
    Manual,
}

#[async_trait]
pub trait ManagedComponent: Send + Sync {
    fn name(&self) -> &str;

    fn category(&self) -> ComponentCategory;

    fn tier(&self) -> StartupTier {
        StartupTier::Support
    }

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    /// 轻量存活检查（一次往返）；默认认为存活
    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// 释放占用的模型或缓冲
    async fn release(&self) {}

    async fn reinitialize(&self, _profile: ModelProfile) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 把策略包装成 Model 类受管组件
pub struct PolicyComponent {
    policy: Arc<dyn Policy>,
}

impl PolicyComponent {
    pub fn new(policy: Arc<dyn Policy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ManagedComponent for PolicyComponent {
    fn name(&self) -> &str {
        self.policy.id()
    }

    fn category(&self) -> ComponentCategory {
        ComponentCategory::Model
    }

    async fn start(&self) -> anyhow::Result<()> {
        // 整体重启时模型已被释放，启动即以标准规格重新加载
        self.policy.reinitialize(ModelProfile::Standard).await?;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// 用空状态做一次推理自检
    async fn health_check(&self) -> anyhow::Result<()> {
        let probe = GameState::empty(0);
        let vote = self.policy.select_action(&probe.features, &probe).await?;
        anyhow::ensure!(
            vote.confidence.is_finite(),
            "policy '{}' produced non-finite confidence",
            self.policy.id()
        );
        Ok(())
    }

    async fn release(&self) {
        self.policy.release().await;
    }

    async fn reinitialize(&self, profile: ModelProfile) -> anyhow::Result<()> {
        self.policy.reinitialize(profile).await?;
        Ok(())
    }
}

/// 组件注册表：保持登记顺序
#[derive(Default)]
pub struct ComponentRegistry {
    components: RwLock<Vec<Arc<dyn ManagedComponent>>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记组件；同名组件会被替换
    pub async fn register(&self, component: Arc<dyn ManagedComponent>) {
        let mut components = self.components.write().await;
        components.retain(|c| c.name() != component.name());
        components.push(component);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn ManagedComponent>> {
        self.components
            .read()
            .await
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.components
            .read()
            .await
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// 按启动层级排序（同层保持登记顺序）
    pub async fn in_start_order(&self) -> Vec<Arc<dyn ManagedComponent>> {
        let mut components = self.components.read().await.clone();
        components.sort_by_key(|c| c.tier());
        components
    }

    pub async fn len(&self) -> usize {
        self.components.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.components.read().await.is_empty()
    }
}
