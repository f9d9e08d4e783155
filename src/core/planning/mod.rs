//! Planning engine: rule-driven task decomposition. Rules score against the
//! question; the winning rule either instantiates a declarative chain
//! template or unrolls its split template into a linear task sequence.
//! Rules and chains are data, loaded from the store and live-editable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::core::agents::AgentFeatures;
use crate::core::error::EngineError;
use crate::core::store::Store;
use crate::core::types::{Scene, now_iso};

const CONFIG_KEY: &str = "planning_config";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanType {
    Business,
    Consumer,
    Mixed,
}

impl LoanType {
    pub fn as_str(self) -> &'static str {
        match self {
            LoanType::Business => "business",
            LoanType::Consumer => "consumer",
            LoanType::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub match_keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<Scene>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_type: Option<LoanType>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(default)]
    pub split_template: Vec<String>,
    #[serde(default)]
    pub preferred_agents: Vec<String>,
    #[serde(default)]
    pub toolchain: AgentFeatures,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainNode {
    pub id: String,
    pub title: String,
    pub assigned_agent: String,
    #[serde(default)]
    pub skippable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub id: String,
    pub name: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    pub nodes: Vec<ChainNode>,
    #[serde(default)]
    pub edges: Vec<(String, String)>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanningConfig {
    #[serde(default)]
    pub rules: Vec<PlanRule>,
    #[serde(default)]
    pub chains: Vec<Chain>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub task_id: String,
    pub title: String,
    pub objective: String,
    pub assigned_agent: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub tools: AgentFeatures,
    #[serde(default)]
    pub skippable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub question: String,
    pub scene: Scene,
    pub loan_type: LoanType,
    pub workflow_mode: String,
    pub tasks: Vec<PlanTask>,
    pub edges: Vec<(String, String)>,
    #[serde(default)]
    pub rationale: Vec<String>,
    pub created_at: String,
}

fn default_true() -> bool {
    true
}

fn default_mode() -> String {
    "a2a_dispatch".to_string()
}

/// The seeded loan-ops rule set: diagnose before deciding, then assess risk,
/// then propose strategy.
pub fn default_planning_config() -> PlanningConfig {
    PlanningConfig {
        rules: vec![
            PlanRule {
                id: "rule-overdue".to_string(),
                name: "逾期与风险诊断".to_string(),
                match_keywords: vec![
                    "逾期".to_string(),
                    "overdue".to_string(),
                    "风险".to_string(),
                    "risk".to_string(),
                ],
                scene: Some(Scene::LoanOps),
                loan_type: None,
                priority: 10,
                enabled: true,
                chain_id: None,
                split_template: vec![
                    "指标拆解".to_string(),
                    "风险评估".to_string(),
                    "策略建议".to_string(),
                ],
                preferred_agents: vec![
                    "loan-metrics-analyst".to_string(),
                    "loan-risk-analyst".to_string(),
                    "loan-strategy-analyst".to_string(),
                ],
                toolchain: AgentFeatures::default(),
            },
            PlanRule {
                id: "rule-growth".to_string(),
                name: "增长与转化分析".to_string(),
                match_keywords: vec![
                    "转化".to_string(),
                    "增长".to_string(),
                    "growth".to_string(),
                    "conversion".to_string(),
                ],
                scene: None,
                loan_type: Some(LoanType::Consumer),
                priority: 5,
                enabled: true,
                chain_id: None,
                split_template: vec!["漏斗拆解".to_string(), "策略建议".to_string()],
                preferred_agents: vec![
                    "funnel-analyst".to_string(),
                    "loan-strategy-analyst".to_string(),
                ],
                toolchain: AgentFeatures::default(),
            },
        ],
        chains: Vec::new(),
    }
}

pub struct PlanningEngine {
    store: Arc<Store>,
}

impl PlanningEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn config(&self) -> Result<PlanningConfig, EngineError> {
        match self.store.get_config(CONFIG_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(default_planning_config()),
        }
    }

    pub async fn update_rules(&self, rules: Vec<PlanRule>) -> Result<PlanningConfig, EngineError> {
        for rule in &rules {
            if rule.id.is_empty() {
                return Err(EngineError::Validation("rule id must not be empty".to_string()));
            }
        }
        let mut config = self.config().await?;
        config.rules = rules;
        self.store
            .put_config(CONFIG_KEY, &serde_json::to_value(&config)?)
            .await?;
        Ok(config)
    }

    pub async fn update_chains(&self, chains: Vec<Chain>) -> Result<PlanningConfig, EngineError> {
        for chain in &chains {
            validate_chain(chain)?;
        }
        let mut config = self.config().await?;
        config.chains = chains;
        self.store
            .put_config(CONFIG_KEY, &serde_json::to_value(&config)?)
            .await?;
        Ok(config)
    }

    pub async fn build_plan(
        &self,
        question: &str,
        scene: Scene,
        loan_type: Option<LoanType>,
    ) -> Result<Plan, EngineError> {
        let config = self.config().await?;
        let loan_type = loan_type.unwrap_or_else(|| infer_loan_type(question));

        let rule = pick_rule(&config.rules, question, scene, loan_type);
        let (tasks, edges, mode) = match rule {
            Some(rule) => {
                let chain = rule
                    .chain_id
                    .as_ref()
                    .and_then(|id| config.chains.iter().find(|c| c.id == *id && c.enabled));
                match chain {
                    Some(chain) => {
                        validate_chain(chain)?;
                        let tasks = chain_tasks(chain, rule, loan_type);
                        (tasks, chain.edges.clone(), chain.mode.clone())
                    }
                    None => linear_tasks(rule, loan_type)?,
                }
            }
            None => {
                // Nothing matched: fall back to the built-in default rule so
                // planning stays total.
                let defaults = default_planning_config();
                let rule = defaults
                    .rules
                    .first()
                    .ok_or_else(|| EngineError::PlanInfeasible("no planning rules".to_string()))?;
                linear_tasks(rule, loan_type)?
            }
        };

        if tasks.is_empty() {
            return Err(EngineError::PlanInfeasible(
                "planning produced no tasks".to_string(),
            ));
        }
        ensure_acyclic(&tasks)?;

        let plan = Plan {
            id: Uuid::new_v4().to_string(),
            question: question.to_string(),
            scene,
            loan_type,
            workflow_mode: mode,
            tasks,
            edges,
            rationale: vec![
                "Diagnose before deciding; jumping straight to strategy risks misreads.".to_string(),
                "Strategy actions require approval before entering the execution queue.".to_string(),
            ],
            created_at: now_iso(),
        };

        self.store
            .append_plan(&plan.id, &serde_json::to_string(&plan)?)
            .await?;
        info!(plan_id = %plan.id, tasks = plan.tasks.len(), "plan built");
        Ok(plan)
    }

    pub async fn get_plan(&self, plan_id: &str) -> Result<Plan, EngineError> {
        let snapshot = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("plan {plan_id}")))?;
        Ok(serde_json::from_str(&snapshot)?)
    }

    pub async fn list_plans(&self, limit: usize) -> Result<Vec<Plan>, EngineError> {
        let snapshots = self.store.list_plans(limit).await?;
        let mut plans = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            plans.push(serde_json::from_str(&snapshot)?);
        }
        Ok(plans)
    }
}

pub fn infer_loan_type(question: &str) -> LoanType {
    let lower = question.to_lowercase();
    if question.contains("经营贷") || lower.contains("business") {
        LoanType::Business
    } else if question.contains("消费贷") || lower.contains("consumer") {
        LoanType::Consumer
    } else {
        LoanType::Mixed
    }
}

/// Score is the number of keyword hits; scene and loan-type agreement add
/// one each. Ties break by priority, then insertion order.
fn pick_rule<'a>(
    rules: &'a [PlanRule],
    question: &str,
    scene: Scene,
    loan_type: LoanType,
) -> Option<&'a PlanRule> {
    let lower = question.to_lowercase();
    let mut best: Option<(i64, i32, usize, &PlanRule)> = None;
    for (idx, rule) in rules.iter().enumerate().filter(|(_, r)| r.enabled) {
        let keyword_hits = rule
            .match_keywords
            .iter()
            .filter(|k| {
                let k = k.to_lowercase();
                !k.is_empty() && (lower.contains(&k) || question.contains(k.as_str()))
            })
            .count() as i64;
        if keyword_hits == 0 {
            continue;
        }
        let mut score = keyword_hits;
        if rule.scene == Some(scene) {
            score += 1;
        }
        if rule.loan_type == Some(loan_type) {
            score += 1;
        }
        let candidate = (score, rule.priority, idx, rule);
        best = match best {
            None => Some(candidate),
            Some(current) => {
                if (candidate.0, candidate.1) > (current.0, current.1)
                    || ((candidate.0, candidate.1) == (current.0, current.1)
                        && candidate.2 < current.2)
                {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        };
    }
    best.map(|(_, _, _, rule)| rule)
}

fn linear_tasks(
    rule: &PlanRule,
    loan_type: LoanType,
) -> Result<(Vec<PlanTask>, Vec<(String, String)>, String), EngineError> {
    if rule.split_template.is_empty() {
        return Err(EngineError::PlanInfeasible(format!(
            "rule '{}' has an empty split template",
            rule.id
        )));
    }
    let mut tasks = Vec::new();
    let mut edges = Vec::new();
    let mut previous: Option<String> = None;
    for (idx, title) in rule.split_template.iter().enumerate() {
        let task_id = format!("task_{}", idx + 1);
        let agent = rule
            .preferred_agents
            .get(idx.min(rule.preferred_agents.len().saturating_sub(1)))
            .cloned()
            .unwrap_or_else(|| "loan-ops-analyst".to_string());
        if let Some(prev) = &previous {
            edges.push((prev.clone(), task_id.clone()));
        }
        tasks.push(PlanTask {
            task_id: task_id.clone(),
            title: title.clone(),
            objective: format!(
                "Complete [{title}] for the {} loan book and produce actionable findings",
                loan_type.as_str()
            ),
            assigned_agent: agent,
            depends_on: previous.iter().cloned().collect(),
            tools: rule.toolchain,
            skippable: false,
        });
        previous = Some(task_id);
    }
    Ok((tasks, edges, default_mode()))
}

fn chain_tasks(chain: &Chain, rule: &PlanRule, loan_type: LoanType) -> Vec<PlanTask> {
    let mut depends: HashMap<&str, Vec<String>> = HashMap::new();
    for (from, to) in &chain.edges {
        depends.entry(to.as_str()).or_default().push(from.clone());
    }
    chain
        .nodes
        .iter()
        .map(|node| PlanTask {
            task_id: node.id.clone(),
            title: node.title.clone(),
            objective: format!(
                "Complete [{}] for the {} loan book and produce actionable findings",
                node.title,
                loan_type.as_str()
            ),
            assigned_agent: node.assigned_agent.clone(),
            depends_on: depends.get(node.id.as_str()).cloned().unwrap_or_default(),
            tools: rule.toolchain,
            skippable: node.skippable,
        })
        .collect()
}

fn validate_chain(chain: &Chain) -> Result<(), EngineError> {
    let ids: HashSet<&str> = chain.nodes.iter().map(|n| n.id.as_str()).collect();
    if ids.len() != chain.nodes.len() {
        return Err(EngineError::Validation(format!(
            "chain '{}' has duplicate node ids",
            chain.id
        )));
    }
    for (from, to) in &chain.edges {
        if !ids.contains(from.as_str()) || !ids.contains(to.as_str()) {
            return Err(EngineError::PlanInfeasible(format!(
                "chain '{}' edge ({from} -> {to}) references an unknown node",
                chain.id
            )));
        }
    }
    Ok(())
}

/// Kahn's toposort over the task dependency graph; leftovers mean a cycle.
fn ensure_acyclic(tasks: &[PlanTask]) -> Result<(), EngineError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        in_degree.entry(task.task_id.as_str()).or_insert(0);
        for dep in &task.depends_on {
            *in_degree.entry(task.task_id.as_str()).or_insert(0) += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.task_id.as_str());
        }
    }

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop() {
        visited += 1;
        if let Some(next) = dependents.get(id) {
            for dependent in next {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(dependent);
                    }
                }
            }
        }
    }
    if visited != in_degree.len() {
        return Err(EngineError::PlanInfeasible(
            "task graph contains a cycle".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PlanningEngine {
        PlanningEngine::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn builds_linear_plan_from_matching_rule() {
        let engine = engine();
        let plan = engine
            .build_plan("为什么经营贷逾期率上升", Scene::LoanOps, None)
            .await
            .unwrap();
        assert_eq!(plan.loan_type, LoanType::Business);
        assert_eq!(plan.tasks.len(), 3);
        assert_eq!(plan.tasks[0].depends_on.len(), 0);
        assert_eq!(plan.tasks[1].depends_on, vec!["task_1".to_string()]);
        assert_eq!(plan.tasks[2].depends_on, vec!["task_2".to_string()]);
        assert_eq!(plan.edges.len(), 2);

        // Persisted in plan history.
        let loaded = engine.get_plan(&plan.id).await.unwrap();
        assert_eq!(loaded.tasks.len(), 3);
    }

    #[tokio::test]
    async fn unmatched_question_falls_back_to_default_template() {
        let engine = engine();
        let plan = engine
            .build_plan("quarterly portfolio report", Scene::DataDiscuss, None)
            .await
            .unwrap();
        assert_eq!(plan.tasks.len(), 3);
    }

    #[tokio::test]
    async fn chain_template_produces_dag() {
        let engine = engine();
        let chain = Chain {
            id: "chain-diamond".to_string(),
            name: "diamond".to_string(),
            mode: default_mode(),
            nodes: vec![
                ChainNode {
                    id: "a".into(),
                    title: "collect".into(),
                    assigned_agent: "collector".into(),
                    skippable: false,
                },
                ChainNode {
                    id: "b".into(),
                    title: "analyze-risk".into(),
                    assigned_agent: "risk".into(),
                    skippable: false,
                },
                ChainNode {
                    id: "c".into(),
                    title: "analyze-growth".into(),
                    assigned_agent: "growth".into(),
                    skippable: true,
                },
                ChainNode {
                    id: "d".into(),
                    title: "synthesize".into(),
                    assigned_agent: "strategy".into(),
                    skippable: false,
                },
            ],
            edges: vec![
                ("a".into(), "b".into()),
                ("a".into(), "c".into()),
                ("b".into(), "d".into()),
                ("c".into(), "d".into()),
            ],
            enabled: true,
        };
        engine.update_chains(vec![chain]).await.unwrap();
        let mut rules = engine.config().await.unwrap().rules;
        rules[0].chain_id = Some("chain-diamond".to_string());
        engine.update_rules(rules).await.unwrap();

        let plan = engine
            .build_plan("逾期风险全面分析", Scene::LoanOps, Some(LoanType::Mixed))
            .await
            .unwrap();
        assert_eq!(plan.tasks.len(), 4);
        let d = plan.tasks.iter().find(|t| t.task_id == "d").unwrap();
        let mut deps = d.depends_on.clone();
        deps.sort();
        assert_eq!(deps, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn cyclic_chain_is_infeasible() {
        let tasks = vec![
            PlanTask {
                task_id: "x".into(),
                title: "x".into(),
                objective: "x".into(),
                assigned_agent: "a".into(),
                depends_on: vec!["y".into()],
                tools: AgentFeatures::default(),
                skippable: false,
            },
            PlanTask {
                task_id: "y".into(),
                title: "y".into(),
                objective: "y".into(),
                assigned_agent: "a".into(),
                depends_on: vec!["x".into()],
                tools: AgentFeatures::default(),
                skippable: false,
            },
        ];
        let err = ensure_acyclic(&tasks).unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::PlanInfeasible);
    }

    #[test]
    fn loan_type_inference() {
        assert_eq!(infer_loan_type("经营贷额度分析"), LoanType::Business);
        assert_eq!(infer_loan_type("consumer funnel"), LoanType::Consumer);
        assert_eq!(infer_loan_type("overall portfolio"), LoanType::Mixed);
    }

    #[tokio::test]
    async fn keyword_hits_and_context_bonuses_weigh_equally() {
        let engine = engine();
        // Two keyword hits with no context agreement ties with one hit plus
        // scene agreement; priority settles it.
        let rules = vec![
            PlanRule {
                id: "two-keywords".into(),
                name: "two-keywords".into(),
                match_keywords: vec!["overdue".into(), "migration".into()],
                scene: None,
                loan_type: None,
                priority: 1,
                enabled: true,
                chain_id: None,
                split_template: vec!["a".into()],
                preferred_agents: vec!["agent-keywords".into()],
                toolchain: AgentFeatures::default(),
            },
            PlanRule {
                id: "one-keyword-with-scene".into(),
                name: "one-keyword-with-scene".into(),
                match_keywords: vec!["overdue".into()],
                scene: Some(Scene::LoanOps),
                loan_type: None,
                priority: 2,
                enabled: true,
                chain_id: None,
                split_template: vec!["b".into()],
                preferred_agents: vec!["agent-scene".into()],
                toolchain: AgentFeatures::default(),
            },
        ];
        engine.update_rules(rules).await.unwrap();
        let plan = engine
            .build_plan("overdue and migration trend", Scene::LoanOps, None)
            .await
            .unwrap();
        assert_eq!(plan.tasks[0].assigned_agent, "agent-scene");
    }

    #[tokio::test]
    async fn rule_priority_breaks_ties() {
        let engine = engine();
        let rules = vec![
            PlanRule {
                id: "low".into(),
                name: "low".into(),
                match_keywords: vec!["overdue".into()],
                scene: None,
                loan_type: None,
                priority: 1,
                enabled: true,
                chain_id: None,
                split_template: vec!["a".into()],
                preferred_agents: vec!["agent-low".into()],
                toolchain: AgentFeatures::default(),
            },
            PlanRule {
                id: "high".into(),
                name: "high".into(),
                match_keywords: vec!["overdue".into()],
                scene: None,
                loan_type: None,
                priority: 9,
                enabled: true,
                chain_id: None,
                split_template: vec!["b".into()],
                preferred_agents: vec!["agent-high".into()],
                toolchain: AgentFeatures::default(),
            },
        ];
        engine.update_rules(rules).await.unwrap();
        let plan = engine
            .build_plan("overdue trend", Scene::DataDiscuss, None)
            .await
            .unwrap();
        assert_eq!(plan.tasks[0].assigned_agent, "agent-high");
    }
}
