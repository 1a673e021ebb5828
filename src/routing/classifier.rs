//! 请求分类器
//!
//! 纯函数：对每个候选领域组合三路信号（文件提示、关键词、文本模式）加权求和，
//! 超过阈值的领域按得分降序入选；没有领域过阈值时回落到默认领域并标记 `ambiguous`。
//! 不做 I/O，可在任意线程并发调用。

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::capability::{Context, Domain, Pattern};

/// 入站路由请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<String>,
    /// 0-10，缺省时从文本推断
    #[serde(default)]
    pub urgency: Option<u8>,
    /// 转发该请求的组件
    #[serde(default)]
    pub origin: Option<String>,
    /// 远程调用的操作名，缺省为 "handle"
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RoutingRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_files<I: IntoIterator<Item = S>, S: Into<String>>(mut self, files: I) -> Self {
        self.files.extend(files.into_iter().map(Into::into));
        self
    }

    pub fn with_subtasks<I: IntoIterator<Item = S>, S: Into<String>>(mut self, subtasks: I) -> Self {
        self.subtasks.extend(subtasks.into_iter().map(Into::into));
        self
    }

    pub fn from_component(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    fn bump(self) -> Self {
        match self {
            Complexity::Simple => Complexity::Moderate,
            _ => Complexity::Complex,
        }
    }

    /// 基准耗时（分钟）
    pub fn base_minutes(self) -> u64 {
        match self {
            Complexity::Simple => 15,
            Complexity::Moderate => 60,
            Complexity::Complex => 240,
        }
    }
}

/// 分类结果，创建后不可变
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    /// 非空，按得分降序
    pub domains: Vec<Domain>,
    pub domain_scores: Vec<(Domain, f64)>,
    pub complexity: Complexity,
    pub contexts: BTreeSet<Context>,
    pub patterns: BTreeSet<Pattern>,
    pub urgency: u8,
    pub estimated_duration_mins: u64,
    /// 没有领域过阈值，使用了默认领域
    pub ambiguous: bool,
}

impl Classification {
    pub fn primary_domain(&self) -> &Domain {
        // domains 恒非空
        &self.domains[0]
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub domain_threshold: f64,
    pub default_domain: Domain,
    pub file_weight: f64,
    pub keyword_weight: f64,
    pub pattern_weight: f64,
    /// 关键词命中数达到该值即视为满分
    pub keyword_saturation: usize,
    pub moderate_subtasks: usize,
    pub complex_subtasks: usize,
    pub moderate_files: usize,
    pub complex_files: usize,
    /// 额外的领域关键词（通常来自组件清单）
    pub extra_keywords: BTreeMap<Domain, Vec<String>>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            domain_threshold: 0.15,
            default_domain: Domain::Backend,
            file_weight: 0.40,
            keyword_weight: 0.35,
            pattern_weight: 0.25,
            keyword_saturation: 2,
            moderate_subtasks: 3,
            complex_subtasks: 6,
            moderate_files: 3,
            complex_files: 10,
            extra_keywords: BTreeMap::new(),
        }
    }
}

struct DomainRules {
    domain: Domain,
    files: Vec<glob::Pattern>,
    keywords: Vec<String>,
    patterns: Vec<Regex>,
}

const DOMAIN_TABLE: &[(&str, &[&str], &[&str], &[&str])] = &[
    (
        "frontend",
        &["*.tsx", "*.jsx", "*.vue", "*.svelte", "*.css", "*.scss", "*.html", "*/components/*"],
        &["frontend", "ui", "react", "vue", "angular", "css", "page", "button", "layout", "component"],
        &[r"<[a-z][a-z0-9-]*(\s[^>]*)?>", r"\buse[A-Z]\w+\(", r"\b(onclick|classname|flexbox)\b"],
    ),
    (
        "backend",
        &["*.rs", "*.go", "*.py", "*.java", "*/api/*", "*/handlers/*", "*/services/*"],
        &["backend", "api", "endpoint", "server", "service", "handler", "middleware", "rest", "graphql"],
        &[r"\b(get|post|put|patch|delete)\s+/\S*", r"\b(fn|def|func)\s+\w+\(", r"\bstatus\s+code\s+\d{3}\b"],
    ),
    (
        "database",
        &["*.sql", "*/migrations/*", "*.prisma", "*/schema/*"],
        &["database", "sql", "postgres", "mysql", "sqlite", "schema", "table", "query", "index", "migration", "mongo"],
        &[r"\b(create|alter|drop)\s+table\b", r"\bselect\b.+\bfrom\b", r"\b(foreign|primary)\s+key\b"],
    ),
    (
        "infrastructure",
        &["*.tf", "*.tfvars", "*.hcl", "*/k8s/*", "*/terraform/*"],
        &["infrastructure", "terraform", "aws", "azure", "gcp", "cloud", "vpc", "kubernetes", "k8s", "cluster"],
        &[r#"\bresource\s+"\w+""#, r"\bterraform\s+(plan|apply|init)\b", r"\b(t2|t3|m5)\.\w+\b"],
    ),
    (
        "devops",
        &["*/.github/workflows/*", "*Jenkinsfile", "*.gitlab-ci.yml", "*Dockerfile*", "*/helm/*"],
        &["devops", "pipeline", "ci", "cd", "deploy", "docker", "helm", "jenkins", "release", "rollout"],
        &[r"\b(kubectl|helm|docker)\s+\w+", r"\bon:\s*(push|pull_request)\b", r"\bblue[- ]green\b"],
    ),
    (
        "security",
        &["*.pem", "*.key", "*/auth/*", "*/security/*"],
        &["security", "auth", "oauth", "jwt", "vulnerability", "secret", "encrypt", "permission", "rbac", "xss"],
        &[r"\bcve-\d{4}-\d+\b", r"\b(sql|command)\s+injection\b", r"\b(tls|mtls|ssl)\b"],
    ),
    (
        "testing",
        &["*_test.*", "*.test.*", "*.spec.*", "*/tests/*"],
        &["test", "testing", "coverage", "e2e", "mock", "assert", "flaky", "fixture"],
        &[r"\b(unit|integration|e2e|end-to-end)\s+tests?\b", r"\b\d{1,3}%\s+coverage\b", r"\bassert\w*\("],
    ),
    (
        "documentation",
        &["*.md", "*.rst", "*.adoc", "*/docs/*"],
        &["docs", "documentation", "readme", "guide", "tutorial", "changelog", "runbook"],
        &[r"\bdocument(ing|ation)?\s+(the|how|our)\b", r"\bapi\s+reference\b", r"\bwrite\s+(a|the)\s+guide\b"],
    ),
    (
        "data",
        &["*.ipynb", "*.csv", "*.parquet", "*/notebooks/*"],
        &["data", "etl", "analytics", "warehouse", "dataset", "spark", "pandas", "dashboard"],
        &[r"\b(etl|elt)\s+(job|pipeline)s?\b", r"\bdata\s*frames?\b", r"\b(group|partition)\s+by\b"],
    ),
];

const CONTEXT_TABLE: &[(&str, &[&str])] = &[
    ("code-generation", &["create", "implement", "build", "add", "generate", "write", "scaffold"]),
    ("review", &["review", "audit", "inspect"]),
    ("debugging", &["fix", "bug", "error", "debug", "crash", "broken", "failing"]),
    ("refactoring", &["refactor", "cleanup", "restructure", "simplify"]),
    ("deployment", &["deploy", "release", "rollout", "ship"]),
    ("migration", &["migrate", "migration", "upgrade", "port"]),
    ("optimization", &["optimize", "performance", "slow", "latency", "speed"]),
    ("documentation", &["document", "docs", "readme"]),
];

const PATTERN_TABLE: &[(&str, &[&str])] = &[
    ("rest", &["rest", "restful", "endpoint"]),
    ("graphql", &["graphql", "resolver"]),
    ("microservices", &["microservice", "microservices"]),
    ("event-driven", &["event", "kafka", "queue", "pubsub", "webhook"]),
    ("crud", &["crud"]),
    ("serverless", &["serverless", "lambda"]),
    ("gitops", &["gitops", "argocd", "flux"]),
    ("iac", &["terraform", "iac", "pulumi", "bicep"]),
];

const URGENT_WORDS: &[&str] = &["urgent", "asap", "critical", "outage", "hotfix", "immediately", "emergency"];
const RELAXED_WORDS: &[&str] = &["whenever", "eventually", "someday", "backlog"];

/// 请求分类器
pub struct RequestClassifier {
    config: ClassifierConfig,
    rules: Vec<DomainRules>,
}

impl RequestClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        let rules = DOMAIN_TABLE
            .iter()
            .map(|(domain, files, keywords, patterns)| {
                let domain = Domain::from(*domain);
                let mut keywords: Vec<String> = keywords.iter().map(|k| k.to_string()).collect();
                if let Some(extra) = config.extra_keywords.get(&domain) {
                    keywords.extend(extra.iter().map(|k| k.to_lowercase()));
                }
                DomainRules {
                    domain,
                    files: files.iter().filter_map(|p| glob::Pattern::new(p).ok()).collect(),
                    keywords,
                    patterns: patterns
                        .iter()
                        .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
                        .collect(),
                }
            })
            .collect();

        Self { config, rules }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn classify(&self, request: &RoutingRequest) -> Classification {
        let text = request_text(request);
        let tokens = tokenize(&text);
        let files: Vec<String> = request.files.iter().map(|f| format!("/{}", f.trim_start_matches('/'))).collect();

        let mut scored: Vec<(Domain, f64)> = self
            .rules
            .iter()
            .map(|rules| (rules.domain.clone(), self.domain_score(rules, &files, &tokens, &text)))
            .filter(|(_, score)| *score > self.config.domain_threshold)
            .collect();
        // 稳定排序：同分保持表顺序
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let ambiguous = scored.is_empty();
        let domains: Vec<Domain> = if ambiguous {
            tracing::debug!(default = %self.config.default_domain, "No domain cleared threshold, using default");
            vec![self.config.default_domain.clone()]
        } else {
            scored.iter().map(|(d, _)| d.clone()).collect()
        };

        let complexity = self.complexity(request, domains.len());
        let estimated_duration_mins = complexity.base_minutes() * domains.len() as u64;

        Classification {
            contexts: vocabulary_hits(CONTEXT_TABLE, &tokens),
            patterns: vocabulary_hits(PATTERN_TABLE, &tokens),
            urgency: request.urgency.map(|u| u.min(10)).unwrap_or_else(|| infer_urgency(&tokens)),
            domains,
            domain_scores: scored,
            complexity,
            estimated_duration_mins,
            ambiguous,
        }
    }

    fn domain_score(&self, rules: &DomainRules, files: &[String], tokens: &[String], text: &str) -> f64 {
        let file_signal = if files.is_empty() {
            0.0
        } else {
            let hits = files
                .iter()
                .filter(|f| rules.files.iter().any(|p| p.matches(f)))
                .count();
            hits as f64 / files.len() as f64
        };

        let saturation = self.config.keyword_saturation.max(1);
        let keyword_hits = rules
            .keywords
            .iter()
            .filter(|k| tokens.iter().any(|t| keyword_matches(t, k)))
            .count();
        let keyword_signal = keyword_hits.min(saturation) as f64 / saturation as f64;

        let pattern_hits = rules.patterns.iter().filter(|p| p.is_match(text)).count();
        let pattern_signal = pattern_hits.min(2) as f64 / 2.0;

        self.config.file_weight * file_signal
            + self.config.keyword_weight * keyword_signal
            + self.config.pattern_weight * pattern_signal
    }

    fn complexity(&self, request: &RoutingRequest, domain_count: usize) -> Complexity {
        let subtasks = request.subtasks.len();
        let files = request.files.len();
        let c = &self.config;
        let base = if subtasks >= c.complex_subtasks || files >= c.complex_files {
            Complexity::Complex
        } else if subtasks >= c.moderate_subtasks || files >= c.moderate_files {
            Complexity::Moderate
        } else {
            Complexity::Simple
        };
        if domain_count > 1 {
            base.bump()
        } else {
            base
        }
    }
}

impl Default for RequestClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

fn request_text(request: &RoutingRequest) -> String {
    let mut text = request.description.clone();
    for subtask in &request.subtasks {
        text.push('\n');
        text.push_str(subtask);
    }
    text
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// 词首匹配：`api` 命中 `apis`，短关键词（≤3 字符）需完全相等
fn keyword_matches(token: &str, keyword: &str) -> bool {
    if keyword.len() <= 3 {
        token == keyword || token.strip_suffix('s') == Some(keyword)
    } else {
        token.starts_with(keyword)
    }
}

fn vocabulary_hits<T: From<&'static str> + Ord>(table: &'static [(&'static str, &'static [&'static str])], tokens: &[String]) -> BTreeSet<T> {
    table
        .iter()
        .filter(|(_, words)| words.iter().any(|w| tokens.iter().any(|t| keyword_matches(t, w))))
        .map(|(name, _)| T::from(*name))
        .collect()
}

fn infer_urgency(tokens: &[String]) -> u8 {
    let urgent = URGENT_WORDS.iter().filter(|w| tokens.iter().any(|t| t == *w)).count();
    if urgent > 0 {
        return (6 + 2 * urgent).min(10) as u8;
    }
    if RELAXED_WORDS.iter().any(|w| tokens.iter().any(|t| t == *w)) {
        return 2;
    }
    5
}
