//! 优雅关闭
//!
//! 关闭顺序由注册顺序决定，main 中为：
//! 1. 取消仍在执行的工作流（Saga 会在原组件上完成补偿）
//! 2. 发布一次全量状态快照，供其他实例合并
//! 3. 停止健康监控、成员监听与状态同步等后台任务

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::orchestrator::Orchestrator;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或输入结束
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UserInitiated => write!(f, "user initiated"),
            ShutdownReason::Signal => write!(f, "signal"),
            ShutdownReason::FatalError(e) => write!(f, "fatal error: {e}"),
        }
    }
}

/// 关闭信号：一个根 token + 第一次触发时的原因
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 根 token，后台任务与工作流从它派生
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                tracing::info!(%reason, "Shutdown requested");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C / SIGTERM 处理
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志中的名称
    fn name(&self) -> &'static str;
}

/// 清理结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<&'static str>,
    pub timed_out: Vec<&'static str>,
}

/// 按注册顺序执行清理任务，单个任务失败或超时不影响后续任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            task_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }

    pub async fn run_cleanup(&self) -> CleanupReport {
        tracing::info!(
            tasks = self.tasks.len(),
            reason = ?self.manager.reason(),
            "Running shutdown cleanup"
        );

        let mut report = CleanupReport::default();
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.task_timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!(task = name, "Cleanup completed");
                    report.completed.push(name);
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = name, "Cleanup failed: {:#}", e);
                    report.failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(task = name, timeout_ms = self.task_timeout.as_millis() as u64, "Cleanup timed out");
                    report.timed_out.push(name);
                }
            }
        }
        report
    }
}

/// 取消所有仍在执行的工作流，并等待它们退出运行表
pub struct WorkflowDrainCleanup {
    orchestrator: Arc<Orchestrator>,
    poll_interval: Duration,
}

impl WorkflowDrainCleanup {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            poll_interval: Duration::from_millis(20),
        }
    }
}

#[async_trait]
impl ShutdownCleanup for WorkflowDrainCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let engine = self.orchestrator.workflows();
        let running = engine.running().await;
        if running.is_empty() {
            return Ok(());
        }
        tracing::info!(count = running.len(), "Cancelling in-flight workflows");
        for id in &running {
            engine.cancel(id).await;
        }
        // 超时由协调器兜底
        while !engine.running().await.is_empty() {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "WorkflowDrain"
    }
}

/// 发布最终状态快照
pub struct StateFlushCleanup {
    orchestrator: Arc<Orchestrator>,
}

impl StateFlushCleanup {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ShutdownCleanup for StateFlushCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let published = self.orchestrator.sync().flush().await?;
        tracing::info!(published, "Final state snapshot published");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "StateFlush"
    }
}

/// 取消后台任务并等待其退出
pub struct BackgroundTasksCleanup {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTasksCleanup {
    pub fn new(token: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self {
            token,
            handle: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait]
impl ShutdownCleanup for BackgroundTasksCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.token.cancel();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "BackgroundTasks"
    }
}

/// 运行主应用直到结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(manager: Arc<ShutdownManager>, app: F, cleanup: impl FnOnce() -> Fut)
where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("Application finished"),
        _ = manager.wait_for_shutdown() => tracing::info!(reason = ?manager.reason(), "Shutdown signal received"),
    }

    cleanup().await;
}
