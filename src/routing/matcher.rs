//! 能力匹配器
//!
//! score = (base + 30×领域命中 + 20×上下文命中 + 15×模式命中) × priority/100 × availability
//!
//! 健康状态为 `down` 的组件跳过；其余按得分降序，同分按注册顺序。
//! 零命中的组件仍保有 base 分，作为低置信度的默认路由。

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use super::capability::{Domain, HealthSnapshot};
use super::classifier::Classification;
use super::registry::ComponentRecord;
use crate::resilience::ResilienceLayer;

/// 组件可用性来源（0.0 - 1.0）
pub trait AvailabilitySource: Send + Sync {
    fn availability(&self, component: &str) -> f64;
}

impl AvailabilitySource for ResilienceLayer {
    fn availability(&self, component: &str) -> f64 {
        ResilienceLayer::availability(self, component)
    }
}

impl AvailabilitySource for HashMap<String, f64> {
    fn availability(&self, component: &str) -> f64 {
        self.get(component).copied().unwrap_or(1.0)
    }
}

/// 所有组件视为完全可用
pub struct FullAvailability;

impl AvailabilitySource for FullAvailability {
    fn availability(&self, _component: &str) -> f64 {
        1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Domain,
    Context,
    Pattern,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityMatch {
    pub kind: CapabilityKind,
    pub value: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityScore {
    pub component_id: String,
    pub score: f64,
    pub matched: Vec<CapabilityMatch>,
    pub health: HealthSnapshot,
    pub availability: f64,
    /// 本组件覆盖的请求领域
    pub covered_domains: BTreeSet<Domain>,
    #[serde(skip)]
    pub sequence: u64,
}

impl CapabilityScore {
    pub fn covers(&self, domain: &Domain) -> bool {
        self.covered_domains.contains(domain)
    }
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub base_score: f64,
    pub domain_weight: f64,
    pub context_weight: f64,
    pub pattern_weight: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            base_score: 10.0,
            domain_weight: 30.0,
            context_weight: 20.0,
            pattern_weight: 15.0,
        }
    }
}

pub struct CapabilityMatcher {
    config: MatcherConfig,
}

impl CapabilityMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// 对注册表快照打分；`origin` 为转发该请求的组件，用于路由过滤
    pub fn score(
        &self,
        classification: &Classification,
        components: &[ComponentRecord],
        availability: &dyn AvailabilitySource,
        origin: Option<&str>,
    ) -> Vec<CapabilityScore> {
        let origin_record = origin.and_then(|o| components.iter().find(|c| c.id == o));

        let mut scores: Vec<CapabilityScore> = components
            .iter()
            .filter(|c| !c.is_down())
            .filter(|c| routing_allowed(c, origin, origin_record))
            .map(|c| self.score_one(classification, c, availability.availability(&c.id)))
            .collect();

        scores.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.sequence.cmp(&b.sequence)));
        scores
    }

    fn score_one(&self, classification: &Classification, record: &ComponentRecord, availability: f64) -> CapabilityScore {
        let caps = &record.capabilities;
        let mut matched = Vec::new();
        let mut covered_domains = BTreeSet::new();

        for domain in &classification.domains {
            if caps.domains.contains(domain) {
                covered_domains.insert(domain.clone());
                matched.push(CapabilityMatch {
                    kind: CapabilityKind::Domain,
                    value: domain.to_string(),
                    weight: self.config.domain_weight,
                });
            }
        }
        for context in classification.contexts.intersection(&caps.contexts) {
            matched.push(CapabilityMatch {
                kind: CapabilityKind::Context,
                value: context.to_string(),
                weight: self.config.context_weight,
            });
        }
        for pattern in classification.patterns.intersection(&caps.patterns) {
            matched.push(CapabilityMatch {
                kind: CapabilityKind::Pattern,
                value: pattern.to_string(),
                weight: self.config.pattern_weight,
            });
        }

        let raw = self.config.base_score + matched.iter().map(|m| m.weight).sum::<f64>();
        let availability = availability.clamp(0.0, 1.0);
        let score = raw * (record.routing.priority as f64 / 100.0) * availability;

        CapabilityScore {
            component_id: record.id.clone(),
            score,
            matched,
            health: record.health.clone(),
            availability,
            covered_domains,
            sequence: record.sequence,
        }
    }
}

impl Default for CapabilityMatcher {
    fn default() -> Self {
        Self::new(MatcherConfig::default())
    }
}

fn routing_allowed(candidate: &ComponentRecord, origin: Option<&str>, origin_record: Option<&ComponentRecord>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if candidate.id == origin {
        return false;
    }
    let accepts = &candidate.routing.accepts_routing_from;
    if !accepts.is_empty() && !accepts.iter().any(|a| a == origin) {
        return false;
    }
    match origin_record {
        Some(record) if !record.routing.can_route_to.is_empty() => {
            record.routing.can_route_to.iter().any(|t| t == &candidate.id)
        }
        _ => true,
    }
}
