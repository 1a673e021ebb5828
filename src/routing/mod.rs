//! 路由：请求分类 -> 能力匹配 -> 路由决策
//!
//! 三者都是无状态纯计算，组件注册表是唯一的共享可变对象。

pub mod capability;
pub mod classifier;
pub mod decision;
pub mod matcher;
pub mod registry;

use thiserror::Error;

pub use capability::{
    CapabilitySet, ComponentManifest, Context, Domain, HealthSnapshot, HealthStatus, Pattern, RoutingMetadata,
};
pub use classifier::{Classification, ClassifierConfig, Complexity, RequestClassifier, RoutingRequest};
pub use decision::{
    CollaborationPhase, CollaborationPlan, DecisionConfig, DecisionEngine, DependencyMap, ExecutionStrategy,
    RoutingDecision,
};
pub use matcher::{AvailabilitySource, CapabilityMatcher, CapabilityScore, FullAvailability, MatcherConfig};
pub use registry::{ComponentRecord, ComponentRegistry, RegistryError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("No capable component for {domains:?} (best score {best_score:.1}, minimum {min_viable:.1})")]
    NoCapableComponent {
        domains: Vec<String>,
        best_score: f64,
        min_viable: f64,
    },
}
