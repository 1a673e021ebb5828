//! 路由决策引擎
//!
//! - 主组件：最高分；备选：其后最多 `max_fallbacks` 个
//! - 需要协作：(a) 多领域且主组件未覆盖全部领域；或 (b) complex 且多于一个组件超过高分阈值
//! - 协作计划：每个领域一个阶段，分给覆盖该领域的最高分组件；阶段顺序按显式领域依赖做拓扑排序
//! - 策略：无协作 single；存在依赖 sequential_collaboration；否则 parallel_collaboration

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::capability::Domain;
use super::classifier::{Classification, Complexity};
use super::matcher::CapabilityScore;
use super::RoutingError;
use crate::workflow::graph::DependencyGraph;

/// 领域依赖：key 领域依赖 value 中的领域
pub type DependencyMap = BTreeMap<Domain, BTreeSet<Domain>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Single,
    SequentialCollaboration,
    ParallelCollaboration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborationPhase {
    pub domain: Domain,
    pub component: String,
    pub depends_on: Vec<Domain>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborationPlan {
    /// 已按依赖排序
    pub phases: Vec<CollaborationPhase>,
}

impl CollaborationPlan {
    /// 阶段依赖图：阶段 i 依赖所有领域出现在 `phases[i].depends_on` 中的阶段
    pub fn dependency_graph(&self) -> DependencyGraph {
        let edges = self.phases.iter().enumerate().flat_map(|(i, phase)| {
            self.phases
                .iter()
                .enumerate()
                .filter(move |(j, other)| *j != i && phase.depends_on.contains(&other.domain))
                .map(move |(j, _)| (j, i))
        });
        DependencyGraph::new(self.phases.len(), edges)
    }

    pub fn components(&self) -> BTreeSet<&str> {
        self.phases.iter().map(|p| p.component.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: String,
    pub primary: String,
    pub fallbacks: Vec<String>,
    pub collaboration: Option<CollaborationPlan>,
    pub strategy: ExecutionStrategy,
    /// 相对成本单位（simple = 1 次调用）
    pub estimated_cost: f64,
    pub estimated_duration_mins: u64,
}

impl RoutingDecision {
    /// 主组件 + 备选
    pub fn targets(&self) -> Vec<String> {
        std::iter::once(self.primary.clone())
            .chain(self.fallbacks.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DecisionConfig {
    pub min_viable_score: f64,
    pub high_score_threshold: f64,
    pub max_fallbacks: usize,
    pub domain_dependencies: DependencyMap,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            min_viable_score: 5.0,
            high_score_threshold: 70.0,
            max_fallbacks: 3,
            domain_dependencies: DependencyMap::new(),
        }
    }
}

pub struct DecisionEngine {
    config: DecisionConfig,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    pub fn decide(
        &self,
        classification: &Classification,
        scores: &[CapabilityScore],
    ) -> Result<RoutingDecision, RoutingError> {
        self.decide_with(classification, scores, &DependencyMap::new())
    }

    /// `extra` 为组件清单中声明的领域依赖，与配置中的依赖合并
    pub fn decide_with(
        &self,
        classification: &Classification,
        scores: &[CapabilityScore],
        extra: &DependencyMap,
    ) -> Result<RoutingDecision, RoutingError> {
        let viable: Vec<&CapabilityScore> = scores
            .iter()
            .filter(|s| s.score >= self.config.min_viable_score)
            .collect();

        let Some(primary) = viable.first().copied() else {
            return Err(RoutingError::NoCapableComponent {
                domains: classification.domains.iter().map(|d| d.to_string()).collect(),
                best_score: scores.first().map(|s| s.score).unwrap_or(0.0),
                min_viable: self.config.min_viable_score,
            });
        };

        let fallbacks: Vec<String> = viable
            .iter()
            .skip(1)
            .take(self.config.max_fallbacks)
            .map(|s| s.component_id.clone())
            .collect();

        let uncovered = classification.domains.len() > 1
            && !classification.domains.iter().all(|d| primary.covers(d));
        let high: Vec<&CapabilityScore> = viable
            .iter()
            .copied()
            .filter(|s| s.score > self.config.high_score_threshold)
            .collect();
        let complex_split = classification.complexity == Complexity::Complex && high.len() > 1;

        let collaboration = if uncovered || complex_split {
            let phases = assign_phases(classification, &viable, &high, complex_split);
            let plan = CollaborationPlan {
                phases: self.order_phases(phases, extra),
            };
            if plan.components().len() > 1 {
                Some(plan)
            } else {
                tracing::debug!(primary = %primary.component_id, "Collaboration collapsed to a single component");
                None
            }
        } else {
            None
        };

        let strategy = match &collaboration {
            None => ExecutionStrategy::Single,
            Some(plan) if plan.phases.iter().any(|p| !p.depends_on.is_empty()) => {
                ExecutionStrategy::SequentialCollaboration
            }
            Some(_) => ExecutionStrategy::ParallelCollaboration,
        };

        let (estimated_cost, estimated_duration_mins) = estimate(classification, collaboration.as_ref());

        Ok(RoutingDecision {
            request_id: uuid::Uuid::new_v4().to_string(),
            primary: primary.component_id.clone(),
            fallbacks,
            collaboration,
            strategy,
            estimated_cost,
            estimated_duration_mins,
        })
    }

    fn order_phases(&self, mut phases: Vec<CollaborationPhase>, extra: &DependencyMap) -> Vec<CollaborationPhase> {
        let present: BTreeSet<Domain> = phases.iter().map(|p| p.domain.clone()).collect();
        for phase in &mut phases {
            let mut deps: BTreeSet<Domain> = BTreeSet::new();
            for map in [&self.config.domain_dependencies, extra] {
                if let Some(on) = map.get(&phase.domain) {
                    deps.extend(on.iter().filter(|d| **d != phase.domain && present.contains(*d)).cloned());
                }
            }
            phase.depends_on = deps.into_iter().collect();
        }

        // 只去掉同一个环内部的边；依赖环成员的阶段保留其依赖
        let cycles = CollaborationPlan { phases: phases.clone() }.dependency_graph().cycles();
        for cycle in &cycles {
            let members: BTreeSet<Domain> = cycle.iter().map(|&i| phases[i].domain.clone()).collect();
            tracing::warn!(domains = ?members, "Cyclic domain dependencies, dropping edges inside the cycle");
            for &i in cycle {
                phases[i].depends_on.retain(|d| !members.contains(d));
            }
        }

        let plan = CollaborationPlan { phases };
        let order = plan.dependency_graph().topological_order();
        let phases = plan.phases;

        let mut indexed: Vec<Option<CollaborationPhase>> = phases.into_iter().map(Some).collect();
        order
            .flatten()
            .into_iter()
            .chain(order.cyclic.iter().copied())
            .filter_map(|i| indexed[i].take())
            .collect()
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new(DecisionConfig::default())
    }
}

fn assign_phases(
    classification: &Classification,
    viable: &[&CapabilityScore],
    high: &[&CapabilityScore],
    complex_split: bool,
) -> Vec<CollaborationPhase> {
    let primary = viable[0];
    let mut used: BTreeSet<&str> = BTreeSet::new();
    let mut phases = Vec::new();

    for domain in &classification.domains {
        let top_covering = viable.iter().copied().find(|s| s.covers(domain));
        let distinct_high = complex_split
            .then(|| high.iter().copied().find(|s| s.covers(domain) && !used.contains(s.component_id.as_str())))
            .flatten();
        let pick = distinct_high.or(top_covering).unwrap_or(primary);
        used.insert(pick.component_id.as_str());
        phases.push(CollaborationPhase {
            domain: domain.clone(),
            component: pick.component_id.clone(),
            depends_on: Vec::new(),
        });
    }

    if complex_split {
        for score in high {
            if used.insert(score.component_id.as_str()) {
                let domain = classification
                    .domains
                    .iter()
                    .find(|d| score.covers(d))
                    .unwrap_or_else(|| classification.primary_domain());
                phases.push(CollaborationPhase {
                    domain: domain.clone(),
                    component: score.component_id.clone(),
                    depends_on: Vec::new(),
                });
            }
        }
    }

    phases
}

fn estimate(classification: &Classification, plan: Option<&CollaborationPlan>) -> (f64, u64) {
    let weight = match classification.complexity {
        Complexity::Simple => 1.0,
        Complexity::Moderate => 2.0,
        Complexity::Complex => 4.0,
    };
    let total = classification.estimated_duration_mins;
    match plan {
        None => (weight, total),
        Some(plan) => {
            let phases = plan.phases.len().max(1) as u64;
            let per_phase = total.div_ceil(phases);
            let levels = plan.dependency_graph().topological_order().levels.len().max(1) as u64;
            (weight * phases as f64, per_phase * levels)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::capability::HealthSnapshot;

    fn classification(domains: &[&str], complexity: Complexity) -> Classification {
        Classification {
            domains: domains.iter().map(|d| Domain::from(*d)).collect(),
            domain_scores: Vec::new(),
            complexity,
            contexts: BTreeSet::new(),
            patterns: BTreeSet::new(),
            urgency: 5,
            estimated_duration_mins: 120,
            ambiguous: false,
        }
    }

    fn score(id: &str, score: f64, domains: &[&str], sequence: u64) -> CapabilityScore {
        CapabilityScore {
            component_id: id.to_string(),
            score,
            matched: Vec::new(),
            health: HealthSnapshot::default(),
            availability: 1.0,
            covered_domains: domains.iter().map(|d| Domain::from(*d)).collect(),
            sequence,
        }
    }

    #[test]
    fn test_single_when_primary_covers_all_domains() {
        let c = classification(&["backend", "database"], Complexity::Moderate);
        let scores = vec![score("x", 95.0, &["backend", "database"], 0), score("y", 40.0, &["backend"], 1)];
        let decision = DecisionEngine::default().decide(&c, &scores).unwrap();
        assert_eq!(decision.strategy, ExecutionStrategy::Single);
        assert_eq!(decision.primary, "x");
        assert_eq!(decision.fallbacks, vec!["y"]);
        assert!(decision.collaboration.is_none());
    }

    #[test]
    fn test_collaboration_across_uncovered_domains() {
        let c = classification(&["frontend", "backend"], Complexity::Moderate);
        let scores = vec![score("p", 80.0, &["frontend"], 0), score("q", 60.0, &["backend"], 1)];
        let decision = DecisionEngine::default().decide(&c, &scores).unwrap();
        let plan = decision.collaboration.unwrap();
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.phases[0].component, "p");
        assert_eq!(plan.phases[1].component, "q");
        assert_eq!(decision.strategy, ExecutionStrategy::ParallelCollaboration);
    }

    #[test]
    fn test_dependencies_order_phases_and_force_sequential() {
        let c = classification(&["backend", "database"], Complexity::Moderate);
        let scores = vec![score("api", 80.0, &["backend"], 0), score("db", 60.0, &["database"], 1)];
        let mut config = DecisionConfig::default();
        config
            .domain_dependencies
            .insert(Domain::Backend, [Domain::Database].into_iter().collect());
        let decision = DecisionEngine::new(config).decide(&c, &scores).unwrap();

        let plan = decision.collaboration.unwrap();
        assert_eq!(plan.phases[0].domain, Domain::Database);
        assert_eq!(plan.phases[1].depends_on, vec![Domain::Database]);
        assert_eq!(decision.strategy, ExecutionStrategy::SequentialCollaboration);
        // 两层，每阶段 60 分钟
        assert_eq!(decision.estimated_duration_mins, 120);
    }

    #[test]
    fn test_complex_request_with_two_high_scorers_collaborates() {
        let c = classification(&["backend"], Complexity::Complex);
        let scores = vec![score("a", 90.0, &["backend"], 0), score("b", 85.0, &["backend"], 1)];
        let decision = DecisionEngine::default().decide(&c, &scores).unwrap();
        let plan = decision.collaboration.unwrap();
        let components: Vec<_> = plan.phases.iter().map(|p| p.component.as_str()).collect();
        assert_eq!(components, vec!["a", "b"]);
    }

    #[test]
    fn test_no_capable_component() {
        let c = classification(&["backend"], Complexity::Simple);
        let err = DecisionEngine::default()
            .decide(&c, &[score("weak", 2.0, &[], 0)])
            .unwrap_err();
        assert!(matches!(err, RoutingError::NoCapableComponent { best_score, .. } if best_score == 2.0));
        assert!(DecisionEngine::default().decide(&c, &[]).is_err());
    }

    #[test]
    fn test_fallbacks_capped() {
        let c = classification(&["backend"], Complexity::Simple);
        let scores: Vec<_> = (0..6).map(|i| score(&format!("c{i}"), 50.0 - i as f64, &["backend"], i)).collect();
        let decision = DecisionEngine::default().decide(&c, &scores).unwrap();
        assert_eq!(decision.fallbacks, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_cyclic_dependencies_do_not_deadlock() {
        let c = classification(&["frontend", "backend"], Complexity::Moderate);
        let scores = vec![score("p", 80.0, &["frontend"], 0), score("q", 60.0, &["backend"], 1)];
        let mut extra = DependencyMap::new();
        extra.insert(Domain::Frontend, [Domain::Backend].into_iter().collect());
        extra.insert(Domain::Backend, [Domain::Frontend].into_iter().collect());
        let decision = DecisionEngine::default().decide_with(&c, &scores, &extra).unwrap();
        let plan = decision.collaboration.unwrap();
        assert!(plan.phases.iter().all(|p| p.depends_on.is_empty()));
        assert_eq!(decision.strategy, ExecutionStrategy::ParallelCollaboration);
    }

    #[test]
    fn test_dependency_on_a_cycle_member_is_kept() {
        let c = classification(&["frontend", "backend", "database"], Complexity::Moderate);
        let scores = vec![
            score("p", 80.0, &["frontend"], 0),
            score("q", 60.0, &["backend"], 1),
            score("r", 50.0, &["database"], 2),
        ];
        // frontend <-> backend 成环，database 依赖 frontend
        let mut extra = DependencyMap::new();
        extra.insert(Domain::Frontend, [Domain::Backend].into_iter().collect());
        extra.insert(Domain::Backend, [Domain::Frontend].into_iter().collect());
        extra.insert(Domain::Database, [Domain::Frontend].into_iter().collect());
        let decision = DecisionEngine::default().decide_with(&c, &scores, &extra).unwrap();
        let plan = decision.collaboration.unwrap();

        let position = |domain: Domain| plan.phases.iter().position(|p| p.domain == domain).unwrap();
        let database = &plan.phases[position(Domain::Database)];
        assert_eq!(database.depends_on, vec![Domain::Frontend]);
        assert!(position(Domain::Frontend) < position(Domain::Database));
        assert!(plan.phases[position(Domain::Frontend)].depends_on.is_empty());
        assert!(plan.phases[position(Domain::Backend)].depends_on.is_empty());
        assert_eq!(decision.strategy, ExecutionStrategy::SequentialCollaboration);
    }
}
