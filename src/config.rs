//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ROUTING__HIGH_SCORE_THRESHOLD=80`）。
//! 各段通过 `From<&Section>` 转换为对应模块的运行时配置，模块本身不依赖 `AppConfig`。

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::resilience::{Backoff, CallErrorKind, CircuitBreakerConfig, RetryPolicy};
use crate::routing::{ClassifierConfig, ComponentManifest, DecisionConfig, DependencyMap, Domain, MatcherConfig};
use crate::workflow::WorkflowConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorSection,
    pub classifier: ClassifierSection,
    pub matcher: MatcherSection,
    pub routing: RoutingSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub retry: RetrySection,
    pub workflow: WorkflowSection,
    pub registry: RegistrySection,
    /// 静态组件清单
    pub components: Vec<ComponentManifest>,
}

/// [orchestrator] 段：实例标识、默认请求超时、路由历史容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 未设置时生成 `hive-<uuid>`
    pub instance_id: Option<String>,
    pub request_timeout_ms: u64,
    pub history_capacity: usize,
    /// 额外的组件清单文件（TOML，`[[components]]`）
    pub manifest_path: Option<PathBuf>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            instance_id: None,
            request_timeout_ms: 10_000,
            history_capacity: 256,
            manifest_path: None,
        }
    }
}

impl OrchestratorSection {
    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("hive-{}", uuid::Uuid::new_v4()))
    }
}

/// [classifier] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    pub domain_threshold: f64,
    pub default_domain: String,
    pub file_weight: f64,
    pub keyword_weight: f64,
    pub pattern_weight: f64,
    pub keyword_saturation: usize,
    pub moderate_subtasks: usize,
    pub complex_subtasks: usize,
    pub moderate_files: usize,
    pub complex_files: usize,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        let defaults = ClassifierConfig::default();
        Self {
            domain_threshold: defaults.domain_threshold,
            default_domain: defaults.default_domain.to_string(),
            file_weight: defaults.file_weight,
            keyword_weight: defaults.keyword_weight,
            pattern_weight: defaults.pattern_weight,
            keyword_saturation: defaults.keyword_saturation,
            moderate_subtasks: defaults.moderate_subtasks,
            complex_subtasks: defaults.complex_subtasks,
            moderate_files: defaults.moderate_files,
            complex_files: defaults.complex_files,
        }
    }
}

impl From<&ClassifierSection> for ClassifierConfig {
    fn from(s: &ClassifierSection) -> Self {
        Self {
            domain_threshold: s.domain_threshold,
            default_domain: Domain::from(s.default_domain.as_str()),
            file_weight: s.file_weight,
            keyword_weight: s.keyword_weight,
            pattern_weight: s.pattern_weight,
            keyword_saturation: s.keyword_saturation.max(1),
            moderate_subtasks: s.moderate_subtasks,
            complex_subtasks: s.complex_subtasks,
            moderate_files: s.moderate_files,
            complex_files: s.complex_files,
            extra_keywords: BTreeMap::new(),
        }
    }
}

/// [matcher] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatcherSection {
    pub base_score: f64,
    pub domain_weight: f64,
    pub context_weight: f64,
    pub pattern_weight: f64,
    /// 本地可用率统计窗口（最近调用次数）
    pub availability_window: usize,
}

impl Default for MatcherSection {
    fn default() -> Self {
        let defaults = MatcherConfig::default();
        Self {
            base_score: defaults.base_score,
            domain_weight: defaults.domain_weight,
            context_weight: defaults.context_weight,
            pattern_weight: defaults.pattern_weight,
            availability_window: 20,
        }
    }
}

impl From<&MatcherSection> for MatcherConfig {
    fn from(s: &MatcherSection) -> Self {
        Self {
            base_score: s.base_score,
            domain_weight: s.domain_weight,
            context_weight: s.context_weight,
            pattern_weight: s.pattern_weight,
        }
    }
}

/// [routing] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub min_viable_score: f64,
    pub high_score_threshold: f64,
    pub max_fallbacks: usize,
    /// 领域 -> 它依赖的领域，如 `backend = ["database"]`
    pub domain_dependencies: BTreeMap<String, Vec<String>>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        let defaults = DecisionConfig::default();
        Self {
            min_viable_score: defaults.min_viable_score,
            high_score_threshold: defaults.high_score_threshold,
            max_fallbacks: defaults.max_fallbacks,
            domain_dependencies: BTreeMap::new(),
        }
    }
}

impl From<&RoutingSection> for DecisionConfig {
    fn from(s: &RoutingSection) -> Self {
        let domain_dependencies: DependencyMap = s
            .domain_dependencies
            .iter()
            .map(|(domain, on)| {
                let on: BTreeSet<Domain> = on.iter().map(|d| Domain::from(d.as_str())).collect();
                (Domain::from(domain.as_str()), on)
            })
            .collect();
        Self {
            min_viable_score: s.min_viable_score,
            high_score_threshold: s.high_score_threshold,
            max_fallbacks: s.max_fallbacks,
            domain_dependencies,
        }
    }
}

/// [circuit_breaker] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub timeout_ms: u64,
    pub half_open_retries: u32,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 30_000,
            half_open_retries: 3,
        }
    }
}

impl From<&CircuitBreakerSection> for CircuitBreakerConfig {
    fn from(s: &CircuitBreakerSection) -> Self {
        Self {
            failure_threshold: s.failure_threshold.max(1),
            timeout: Duration::from_millis(s.timeout_ms),
            half_open_retries: s.half_open_retries,
        }
    }
}

/// [retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: Backoff,
    /// 为空表示除熔断/取消外全部可重试
    pub retryable: Vec<CallErrorKind>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff: Backoff::Exponential,
            retryable: Vec::new(),
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(s: &RetrySection) -> Self {
        Self {
            max_retries: s.max_retries,
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms.max(s.base_delay_ms)),
            backoff: s.backoff,
            retryable: (!s.retryable.is_empty()).then(|| s.retryable.iter().copied().collect::<HashSet<_>>()),
        }
    }
}

/// [workflow] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub step_timeout_ms: u64,
    pub max_parallel: usize,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
            max_parallel: 8,
        }
    }
}

impl From<&WorkflowSection> for WorkflowConfig {
    fn from(s: &WorkflowSection) -> Self {
        Self {
            step_timeout: Duration::from_millis(s.step_timeout_ms),
            max_parallel: s.max_parallel.max(1),
        }
    }
}

/// [registry] 段：心跳过期与健康轮询
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub heartbeat_timeout_secs: u64,
    pub health_poll_interval_secs: u64,
    /// 连续轮询失败达到该次数后标记为 down
    pub health_failure_threshold: u32,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 30,
            health_poll_interval_secs: 10,
            health_failure_threshold: 3,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置；调用方决定是否用新配置重建编排器
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
