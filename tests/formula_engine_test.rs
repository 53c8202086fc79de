//! Tests for tiered formula evaluation

use std::collections::BTreeMap;

use hierbase::application::services::formula_engine::{CellValue, FormulaEngine};
use hierbase::application::services::store::Store;
use hierbase::domain::entities::{NodeAttrs, NodeFlags, NodeId, ProjectId, SourceCoords};
use hierbase::domain::error::DomainError;
use hierbase::util::testing::init_test_setup;
use hierbase::ApplicationError;

fn calc_attrs(name: &str) -> NodeAttrs {
    NodeAttrs {
        name: name.to_string(),
        flags: NodeFlags {
            calculation: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn attrs(name: &str) -> NodeAttrs {
    NodeAttrs {
        name: name.to_string(),
        ..Default::default()
    }
}

/// Revenue (R1 + R2 leaves), COGS (C1 leaf), plus two calculated nodes.
fn setup() -> (Store, ProjectId) {
    init_test_setup();
    let store = Store::with_defaults();
    let project = store
        .create_project("Calc KB", SourceCoords::default())
        .unwrap();

    store
        .create_node(&project, NodeId::new("REVENUE"), None, attrs("Revenue"))
        .unwrap();
    store
        .create_node(
            &project,
            NodeId::new("R1"),
            Some(NodeId::new("REVENUE")),
            attrs("R1"),
        )
        .unwrap();
    store
        .create_node(
            &project,
            NodeId::new("R2"),
            Some(NodeId::new("REVENUE")),
            attrs("R2"),
        )
        .unwrap();
    store
        .create_node(&project, NodeId::new("COGS"), None, attrs("COGS"))
        .unwrap();
    store
        .create_node(
            &project,
            NodeId::new("C1"),
            Some(NodeId::new("COGS")),
            attrs("C1"),
        )
        .unwrap();
    store
        .create_node(
            &project,
            NodeId::new("GROSS_PROFIT"),
            None,
            calc_attrs("Gross Profit"),
        )
        .unwrap();
    store
        .create_node(
            &project,
            NodeId::new("MARGIN"),
            None,
            calc_attrs("Margin"),
        )
        .unwrap();
    store.create_formula_group(&project, "CALC").unwrap();
    (store, project)
}

fn base_values(pairs: &[(&str, f64)]) -> BTreeMap<NodeId, f64> {
    pairs
        .iter()
        .map(|(id, v)| (NodeId::new(*id), *v))
        .collect()
}

#[test]
fn given_tiered_rules_when_evaluating_then_lower_tier_finishes_first() {
    let (store, project) = setup();
    store
        .add_formula_rule(
            &project,
            "CALC",
            &NodeId::new("GROSS_PROFIT"),
            1,
            "REVENUE - COGS",
        )
        .unwrap();
    store
        .add_formula_rule(
            &project,
            "CALC",
            &NodeId::new("MARGIN"),
            3,
            "GROSS_PROFIT / REVENUE",
        )
        .unwrap();

    let state = store.snapshot(&project).unwrap();
    let engine = FormulaEngine::new();
    let result = engine
        .evaluate(
            &state,
            &base_values(&[("R1", 60.0), ("R2", 40.0), ("C1", 30.0)]),
        )
        .unwrap();

    assert_eq!(
        result.order,
        vec![NodeId::new("GROSS_PROFIT"), NodeId::new("MARGIN")]
    );
    assert_eq!(
        result.values[&NodeId::new("GROSS_PROFIT")],
        CellValue::Number(70.0)
    );
    assert_eq!(result.values[&NodeId::new("MARGIN")], CellValue::Number(0.7));
}

#[test]
fn given_aggregate_term_when_evaluating_then_subtree_sum_used() {
    let (store, project) = setup();
    store
        .add_formula_rule(&project, "CALC", &NodeId::new("GROSS_PROFIT"), 1, "REVENUE")
        .unwrap();

    let state = store.snapshot(&project).unwrap();
    let result = FormulaEngine::new()
        .evaluate(&state, &base_values(&[("R1", 60.0), ("R2", 40.0)]))
        .unwrap();

    // Parent aggregation equals the sum over its leaves
    assert_eq!(
        result.values[&NodeId::new("GROSS_PROFIT")],
        CellValue::Number(100.0)
    );
}

#[test]
fn given_zero_denominator_when_evaluating_then_undefined_propagates() {
    let (store, project) = setup();
    store
        .add_formula_rule(
            &project,
            "CALC",
            &NodeId::new("GROSS_PROFIT"),
            1,
            "REVENUE / COGS",
        )
        .unwrap();
    store
        .add_formula_rule(
            &project,
            "CALC",
            &NodeId::new("MARGIN"),
            2,
            "GROSS_PROFIT + 1",
        )
        .unwrap();

    let state = store.snapshot(&project).unwrap();
    // No base value for C1, so the COGS rollup is zero
    let result = FormulaEngine::new()
        .evaluate(&state, &base_values(&[("R1", 50.0)]))
        .unwrap();

    assert!(result.values[&NodeId::new("GROSS_PROFIT")].is_undefined());
    // Undefined flows through any operation touching it
    assert!(result.values[&NodeId::new("MARGIN")].is_undefined());
}

#[test]
fn given_rule_reading_higher_tier_when_adding_then_rejected() {
    let (store, project) = setup();
    store
        .add_formula_rule(&project, "CALC", &NodeId::new("MARGIN"), 2, "REVENUE")
        .unwrap();

    let result = store.add_formula_rule(
        &project,
        "CALC",
        &NodeId::new("GROSS_PROFIT"),
        1,
        "MARGIN + 1",
    );

    assert!(matches!(
        result,
        Err(ApplicationError::Domain(DomainError::TierViolation {
            tier: 1,
            reference_tier: 2,
            ..
        }))
    ));
    // The rejected rule must not be stored
    let state = store.snapshot(&project).unwrap();
    assert_eq!(state.all_rules().count(), 1);
}

#[test]
fn given_cycle_within_tier_when_adding_then_rejected_with_members() {
    let (store, project) = setup();
    store
        .add_formula_rule(
            &project,
            "CALC",
            &NodeId::new("GROSS_PROFIT"),
            1,
            "MARGIN + 1",
        )
        .unwrap();

    let result = store.add_formula_rule(
        &project,
        "CALC",
        &NodeId::new("MARGIN"),
        1,
        "GROSS_PROFIT + 1",
    );

    let Err(ApplicationError::Domain(DomainError::FormulaCycle { members })) = result else {
        panic!("expected FormulaCycle");
    };
    assert!(members.contains(&NodeId::new("GROSS_PROFIT")));
    assert!(members.contains(&NodeId::new("MARGIN")));
}

#[test]
fn given_second_rule_for_same_target_when_adding_then_rejected() {
    let (store, project) = setup();
    store
        .add_formula_rule(&project, "CALC", &NodeId::new("MARGIN"), 1, "REVENUE")
        .unwrap();
    store.create_formula_group(&project, "CALC2").unwrap();

    // A second rule for MARGIN, even in another group and tier, would
    // evaluate the target twice with the later value winning.
    let result = store.add_formula_rule(
        &project,
        "CALC2",
        &NodeId::new("MARGIN"),
        2,
        "COGS + 100",
    );

    assert!(matches!(
        result,
        Err(ApplicationError::Domain(DomainError::DuplicateRuleTarget {
            ..
        }))
    ));
    let state = store.snapshot(&project).unwrap();
    assert_eq!(state.all_rules().count(), 1);
}

#[test]
fn given_unknown_reference_when_adding_rule_then_rejected() {
    let (store, project) = setup();

    let result = store.add_formula_rule(
        &project,
        "CALC",
        &NodeId::new("GROSS_PROFIT"),
        1,
        "NO_SUCH_NODE + 1",
    );

    assert!(matches!(
        result,
        Err(ApplicationError::Domain(
            DomainError::UnresolvedFormulaReference { .. }
        ))
    ));
}

#[test]
fn given_tier_outside_range_when_adding_rule_then_rejected() {
    let (store, project) = setup();

    let result = store.add_formula_rule(
        &project,
        "CALC",
        &NodeId::new("GROSS_PROFIT"),
        6,
        "REVENUE",
    );

    assert!(matches!(
        result,
        Err(ApplicationError::Domain(DomainError::TierOutOfRange {
            tier: 6,
            max: 5,
        }))
    ));
}

#[test]
fn given_independent_projects_when_evaluating_all_then_each_gets_result() {
    init_test_setup();
    let store = Store::with_defaults();
    let engine = FormulaEngine::new();
    let mut inputs = Vec::new();
    for name in ["P1", "P2", "P3"] {
        let project = store
            .create_project(name, SourceCoords::default())
            .unwrap();
        store
            .create_node(&project, NodeId::new("N"), None, attrs("N"))
            .unwrap();
        store
            .create_node(&project, NodeId::new("T"), None, calc_attrs("T"))
            .unwrap();
        store.create_formula_group(&project, "G").unwrap();
        store
            .add_formula_rule(&project, "G", &NodeId::new("T"), 1, "N * 2")
            .unwrap();
        inputs.push((
            store.snapshot(&project).unwrap(),
            base_values(&[("N", 21.0)]),
        ));
    }

    let results = engine.evaluate_all(inputs);

    assert_eq!(results.len(), 3);
    for (_, result) in results {
        let result = result.unwrap();
        assert_eq!(result.values[&NodeId::new("T")], CellValue::Number(42.0));
    }
}
