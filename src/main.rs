//! Hive - 组件编排内核
//!
//! 入口：初始化日志、加载配置、构建编排器，从标准输入逐行读取 JSON 路由请求，
//! 把分类与路由决策以 JSON 输出到标准输出。

use std::sync::Arc;

use anyhow::Context;
use hive::config::load_config;
use hive::core::shutdown::{
    run_with_graceful_shutdown, BackgroundTasksCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    StateFlushCleanup, WorkflowDrainCleanup,
};
use hive::core::OrchestratorBuilder;
use hive::routing::{ComponentManifest, RoutingRequest};
use hive::Orchestrator;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let mut config = load_config(None).context("Failed to load config")?;
    if config.components.is_empty() && config.orchestrator.manifest_path.is_none() {
        tracing::info!("No components configured, registering demo components");
        config.components = demo_components();
    }

    let orchestrator = Arc::new(
        OrchestratorBuilder::new(config)
            .build()
            .await
            .context("Failed to build orchestrator")?,
    );

    let manager = Arc::new(ShutdownManager::new());
    let monitor = orchestrator
        .start(manager.token())
        .await
        .context("Failed to start orchestrator")?;

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&manager));
    coordinator.register(WorkflowDrainCleanup::new(Arc::clone(&orchestrator)));
    coordinator.register(StateFlushCleanup::new(Arc::clone(&orchestrator)));
    coordinator.register(BackgroundTasksCleanup::new(manager.token(), monitor));

    let app = {
        let orchestrator = Arc::clone(&orchestrator);
        let manager = Arc::clone(&manager);
        async move {
            if let Err(e) = serve_stdin(&orchestrator).await {
                tracing::error!("Input loop failed: {:#}", e);
            }
            manager.shutdown(ShutdownReason::UserInitiated);
        }
    };

    run_with_graceful_shutdown(Arc::clone(&manager), app, || async move {
        let report = coordinator.run_cleanup().await;
        if !report.failed.is_empty() || !report.timed_out.is_empty() {
            tracing::warn!(failed = ?report.failed, timed_out = ?report.timed_out, "Shutdown cleanup incomplete");
        }
    })
    .await;

    Ok(())
}

/// 每行一个 JSON 请求（`RoutingRequest`）；纯文本行按描述处理
async fn serve_stdin(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: RoutingRequest =
            serde_json::from_str(line).unwrap_or_else(|_| RoutingRequest::new(line));

        let output = match orchestrator.route(&request).await {
            Ok((classification, decision)) => json!({
                "classification": classification,
                "decision": decision,
            }),
            Err(e) => json!({
                "error": { "kind": e.kind(), "message": e.to_string() },
            }),
        };
        println!("{}", serde_json::to_string(&output)?);
    }
    Ok(())
}

fn demo_components() -> Vec<ComponentManifest> {
    vec![
        ComponentManifest::new("frontend-agent")
            .domains(["frontend"])
            .contexts(["code-generation", "refactoring"])
            .keywords(["react", "css"]),
        ComponentManifest::new("api-agent")
            .domains(["backend"])
            .contexts(["code-generation", "debugging"])
            .patterns(["rest", "graphql", "crud"]),
        ComponentManifest::new("db-agent")
            .domains(["database"])
            .contexts(["migration", "optimization"])
            .patterns(["crud"]),
        ComponentManifest::new("platform-agent")
            .domains(["infrastructure", "devops"])
            .contexts(["deployment"])
            .patterns(["iac", "gitops"])
            .depends("devops", "infrastructure"),
        ComponentManifest::new("fullstack-agent")
            .domains(["frontend", "backend"])
            .contexts(["code-generation"])
            .priority(80),
    ]
}
