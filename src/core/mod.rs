//! 编排实例：错误分类、构建器、主流程、成员与健康维护、路由历史、优雅关闭

pub mod builder;
pub mod error;
pub mod health;
pub mod history;
pub mod membership;
pub mod orchestrator;
pub mod shutdown;

pub use builder::OrchestratorBuilder;
pub use error::{CompensationFailure, OrchestratorError};
pub use health::{HealthMonitor, HealthMonitorConfig, HealthReport};
pub use history::{RouteOutcome, RouteRecord, RoutingHistory};
pub use membership::{announce, depart, send_heartbeat, MembershipListener};
pub use orchestrator::{Orchestrator, OrchestratorStatus};
pub use shutdown::{CleanupReport, ShutdownCoordinator, ShutdownManager, ShutdownReason};
