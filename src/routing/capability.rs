//! 能力词表与组件清单
//!
//! 领域 / 上下文 / 模式各是一个封闭枚举加 `Other(String)` 兜底，
//! 序列化为小写字符串，未知取值原样进入 `Other`。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! capability_vocabulary {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub const KNOWN: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &str {
                match self {
                    $($name::$variant => $text,)+
                    $name::Other(s) => s.as_str(),
                }
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                let lower = s.trim().to_lowercase();
                match lower.as_str() {
                    $($text => $name::$variant,)+
                    _ => $name::Other(lower),
                }
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name::from(s.as_str())
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

capability_vocabulary!(
    /// 请求所属的技术领域
    Domain {
        Frontend => "frontend",
        Backend => "backend",
        Database => "database",
        Infrastructure => "infrastructure",
        Devops => "devops",
        Security => "security",
        Testing => "testing",
        Documentation => "documentation",
        Data => "data",
    }
);

capability_vocabulary!(
    /// 工作类型
    Context {
        CodeGeneration => "code-generation",
        Review => "review",
        Debugging => "debugging",
        Refactoring => "refactoring",
        Deployment => "deployment",
        Migration => "migration",
        Optimization => "optimization",
        Documentation => "documentation",
    }
);

capability_vocabulary!(
    /// 架构/实现模式
    Pattern {
        Rest => "rest",
        Graphql => "graphql",
        Microservices => "microservices",
        EventDriven => "event-driven",
        Crud => "crud",
        Serverless => "serverless",
        Gitops => "gitops",
        InfrastructureAsCode => "iac",
    }
);

/// 组件声明的能力集合
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitySet {
    pub domains: BTreeSet<Domain>,
    pub contexts: BTreeSet<Context>,
    pub patterns: BTreeSet<Pattern>,
    pub integrations: BTreeSet<String>,
}

impl CapabilitySet {
    pub fn covers(&self, domain: &Domain) -> bool {
        self.domains.contains(domain)
    }
}

fn default_priority() -> u32 {
    100
}

/// 路由元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    /// 优先级，100 为中性（评分乘以 priority/100）
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// 非空时只接受这些组件转发来的请求
    #[serde(default, alias = "acceptsRoutingFrom")]
    pub accepts_routing_from: Vec<String>,
    /// 非空时本组件发起的请求只能转给这些组件
    #[serde(default, alias = "canRouteTo")]
    pub can_route_to: Vec<String>,
    /// 领域依赖：key 领域的阶段必须在 value 领域之后
    #[serde(default)]
    pub domain_dependencies: BTreeMap<Domain, BTreeSet<Domain>>,
}

impl Default for RoutingMetadata {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            keywords: Vec::new(),
            accepts_routing_from: Vec::new(),
            can_route_to: Vec::new(),
            domain_dependencies: BTreeMap::new(),
        }
    }
}

/// 组件注册时提交的清单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentManifest {
    pub id: String,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    #[serde(default)]
    pub routing: RoutingMetadata,
}

impl ComponentManifest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: CapabilitySet::default(),
            routing: RoutingMetadata::default(),
        }
    }

    pub fn domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Domain>,
    {
        self.capabilities.domains.extend(domains.into_iter().map(Into::into));
        self
    }

    pub fn contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Context>,
    {
        self.capabilities.contexts.extend(contexts.into_iter().map(Into::into));
        self
    }

    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Pattern>,
    {
        self.capabilities.patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.routing.priority = priority;
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routing.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn depends(mut self, domain: impl Into<Domain>, on: impl Into<Domain>) -> Self {
        self.routing
            .domain_dependencies
            .entry(domain.into())
            .or_default()
            .insert(on.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Down,
}

/// getStatus 返回的健康快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    #[serde(default, alias = "latencyMs")]
    pub latency_ms: u64,
    #[serde(default, alias = "errorRate")]
    pub error_rate: f64,
}

impl HealthSnapshot {
    pub fn down() -> Self {
        Self {
            status: HealthStatus::Down,
            ..Self::default()
        }
    }
}
