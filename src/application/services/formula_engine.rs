//! Tiered evaluation of calculated nodes.
//!
//! Rules form a dependency graph (rule target → referenced nodes). The
//! graph is checked at definition time: references must resolve, a rule
//! may not read a node defined in a strictly higher tier, and references
//! within one tier must be acyclic. Evaluation then runs tier by tier —
//! tier N finishes completely before tier N+1 starts — with topological
//! ordering inside each tier.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use crate::application::error::{ApplicationError, ApplicationResult};
use crate::application::services::store::ProjectState;
use crate::domain::arena::NodeArena;
use crate::domain::entities::{NodeId, ProjectId};
use crate::domain::error::DomainError;
use crate::domain::formula::{FormulaOp, FormulaRule, FormulaTerm};

/// Result of evaluating one cell. Division by a zero denominator is an
/// explicit undefined value the caller must handle, never a silent zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum CellValue {
    Number(f64),
    Undefined,
}

impl CellValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Undefined => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    fn apply(self, op: FormulaOp, rhs: CellValue) -> CellValue {
        let (Self::Number(a), Self::Number(b)) = (self, rhs) else {
            return Self::Undefined;
        };
        match op {
            FormulaOp::Add => Self::Number(a + b),
            FormulaOp::Subtract => Self::Number(a - b),
            FormulaOp::Multiply => Self::Number(a * b),
            FormulaOp::Divide => {
                if b == 0.0 {
                    Self::Undefined
                } else {
                    Self::Number(a / b)
                }
            }
        }
    }
}

/// Outcome of evaluating one project's rules.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    /// Computed value per calculated node.
    pub values: BTreeMap<NodeId, CellValue>,
    /// Targets in the order they were evaluated (tier-major).
    pub order: Vec<NodeId>,
}

/// Validate the full rule set of a project at definition time.
///
/// Checks, in order: tier range, one rule per target (across all groups),
/// reference resolution, no reference to a node defined in a strictly
/// higher tier, and acyclicity within each tier (reported with the cycle
/// members via SCC).
pub fn validate_definitions(state: &ProjectState, max_tier: u8) -> Result<(), DomainError> {
    let rules: Vec<&FormulaRule> = state.all_rules().map(|(_, r)| r).collect();
    if rules.is_empty() {
        return Ok(());
    }

    let mut tier_of: HashMap<&NodeId, u8> = HashMap::new();
    for rule in &rules {
        if rule.tier == 0 || rule.tier > max_tier {
            return Err(DomainError::TierOutOfRange {
                tier: rule.tier,
                max: max_tier,
            });
        }
        // A target with two rules would evaluate once per tier with the
        // later rule winning, so a second rule is rejected outright.
        if tier_of.insert(&rule.target, rule.tier).is_some() {
            return Err(DomainError::DuplicateRuleTarget {
                target: rule.target.clone(),
            });
        }
    }

    for rule in &rules {
        for reference in rule.expr.referenced_nodes() {
            if !state.nodes.contains_key(reference) {
                return Err(DomainError::UnresolvedFormulaReference {
                    rule: rule.target.clone(),
                    reference: reference.clone(),
                });
            }
            if let Some(&reference_tier) = tier_of.get(reference) {
                if reference_tier > rule.tier {
                    return Err(DomainError::TierViolation {
                        rule: rule.target.clone(),
                        tier: rule.tier,
                        reference: reference.clone(),
                        reference_tier,
                    });
                }
            }
        }
    }

    // Within-tier cycle check over reference edges.
    let mut by_tier: BTreeMap<u8, Vec<&FormulaRule>> = BTreeMap::new();
    for rule in &rules {
        by_tier.entry(rule.tier).or_default().push(rule);
    }
    for (tier, tier_rules) in &by_tier {
        let (graph, _) = tier_graph(tier_rules);
        if toposort(&graph, None).is_err() {
            let members: Vec<NodeId> = tarjan_scc(&graph)
                .into_iter()
                .find(|scc| scc.len() > 1)
                .map(|scc| scc.into_iter().map(|ix| graph[ix].clone()).collect())
                .unwrap_or_default();
            debug!("formula cycle in tier {tier}: {members:?}");
            return Err(DomainError::FormulaCycle { members });
        }
    }

    Ok(())
}

/// Dependency graph of one tier: node = rule target, edge dependency →
/// dependent, so a topological order is a valid evaluation order.
fn tier_graph(rules: &[&FormulaRule]) -> (DiGraph<NodeId, ()>, HashMap<NodeId, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut index: HashMap<NodeId, NodeIndex> = HashMap::new();
    for rule in rules {
        let ix = graph.add_node(rule.target.clone());
        index.insert(rule.target.clone(), ix);
    }
    for rule in rules {
        let target_ix = index[&rule.target];
        for reference in rule.expr.referenced_nodes() {
            if let Some(&dep_ix) = index.get(reference) {
                graph.add_edge(dep_ix, target_ix, ());
            }
        }
    }
    (graph, index)
}

/// Evaluates calculated nodes against caller-supplied base values.
///
/// Base values carry the raw amounts for mapped nodes (loading raw source
/// data is the record-loading collaborator's concern). An `Aggregate`
/// term rolls base values up over the node's subtree.
pub struct FormulaEngine;

impl Default for FormulaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FormulaEngine {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate all rules of a project snapshot, tier by tier.
    pub fn evaluate(
        &self,
        state: &ProjectState,
        base_values: &BTreeMap<NodeId, f64>,
    ) -> ApplicationResult<EvaluationResult> {
        let arena = NodeArena::from_nodes(&state.nodes).map_err(ApplicationError::from)?;

        let mut by_tier: BTreeMap<u8, Vec<&FormulaRule>> = BTreeMap::new();
        for (_, rule) in state.all_rules() {
            by_tier.entry(rule.tier).or_default().push(rule);
        }

        let mut values: BTreeMap<NodeId, CellValue> = BTreeMap::new();
        let mut order: Vec<NodeId> = Vec::new();

        for (tier, rules) in &by_tier {
            debug!("evaluating tier {tier}: {} rule(s)", rules.len());
            let (graph, _) = tier_graph(rules);
            // Cycles are rejected at definition time; a failure here means
            // the snapshot no longer satisfies that invariant.
            let sorted = toposort(&graph, None).map_err(|_| {
                ApplicationError::from(DomainError::FormulaCycle { members: Vec::new() })
            })?;

            let rule_of: HashMap<&NodeId, &FormulaRule> =
                rules.iter().map(|r| (&r.target, *r)).collect();
            for ix in sorted {
                let target = &graph[ix];
                let rule = rule_of[target];
                let value = self.evaluate_rule(rule, &arena, base_values, &values);
                values.insert(target.clone(), value);
                order.push(target.clone());
            }
        }

        Ok(EvaluationResult { values, order })
    }

    fn evaluate_rule(
        &self,
        rule: &FormulaRule,
        arena: &NodeArena,
        base_values: &BTreeMap<NodeId, f64>,
        computed: &BTreeMap<NodeId, CellValue>,
    ) -> CellValue {
        let resolve = |term: &FormulaTerm| -> CellValue {
            match term {
                FormulaTerm::Constant(v) => CellValue::Number(*v),
                FormulaTerm::Aggregate(id) => self.rollup(id, arena, base_values),
                FormulaTerm::Reference(id) => computed.get(id).copied().unwrap_or_else(|| {
                    warn!(
                        "rule for {} reads calculated node {} with no evaluated rule",
                        rule.target, id
                    );
                    CellValue::Undefined
                }),
            }
        };

        let mut acc = resolve(&rule.expr.first);
        for (op, term) in &rule.expr.rest {
            acc = acc.apply(*op, resolve(term));
        }
        acc
    }

    /// Sum base values over the subtree of `id` (upward aggregation).
    fn rollup(
        &self,
        id: &NodeId,
        arena: &NodeArena,
        base_values: &BTreeMap<NodeId, f64>,
    ) -> CellValue {
        let Some(idx) = arena.index_of(id) else {
            return CellValue::Undefined;
        };
        let sum = arena
            .subtree(idx)
            .filter_map(|(_, slot)| base_values.get(&slot.node.id))
            .sum::<f64>();
        CellValue::Number(sum)
    }

    /// Evaluate several independent projects in parallel. Each evaluation
    /// works on its own immutable snapshot, so cross-project parallelism
    /// never races a writer.
    pub fn evaluate_all(
        &self,
        inputs: Vec<(Arc<ProjectState>, BTreeMap<NodeId, f64>)>,
    ) -> Vec<(ProjectId, ApplicationResult<EvaluationResult>)> {
        inputs
            .into_par_iter()
            .map(|(state, base_values)| {
                let id = state.project.id.clone();
                (id, self.evaluate(&state, &base_values))
            })
            .collect()
    }
}
