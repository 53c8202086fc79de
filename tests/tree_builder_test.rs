//! Tests for the tabular import pipeline

use std::sync::Arc;

use hierbase::application::error::{ApplicationError, ImportStage};
use hierbase::application::services::store::Store;
use hierbase::application::services::tree_builder::TreeBuilder;
use hierbase::config::Settings;
use hierbase::domain::entities::{NodeAttrs, NodeId, ProjectId, SourceCoords};
use hierbase::domain::error::DomainError;
use hierbase::domain::tabular::{Dialect, TabularInput, Tier};
use hierbase::util::testing::init_test_setup;

fn setup() -> (Arc<Store>, TreeBuilder, ProjectId) {
    init_test_setup();
    let settings = Arc::new(Settings::default());
    let store = Arc::new(Store::new(&settings));
    let builder = TreeBuilder::new(Arc::clone(&store), settings);
    let project = store
        .create_project("Test KB", SourceCoords::default())
        .expect("create project");
    (store, builder, project)
}

fn input(headers: &[&str], rows: &[&[&str]]) -> TabularInput {
    TabularInput::new(
        headers.iter().map(|s| s.to_string()).collect(),
        rows.iter()
            .map(|r| r.iter().map(|s| s.to_string()).collect())
            .collect(),
    )
}

#[test]
fn given_tier1_value_group_pairs_when_importing_then_roots_and_leaves_built() {
    let (store, builder, project) = setup();
    let file = input(
        &["SRC_VAL", "GRP_NAME"],
        &[&["4100", "Revenue"], &["4200", "Revenue"], &["5100", "COGS"]],
    );

    let report = builder.import_hierarchy(&project, &file, None).unwrap();

    assert_eq!(report.tier, Tier::Tier1);
    assert_eq!(report.nodes, 5);
    assert_eq!(report.mappings, 3);

    let state = store.snapshot(&project).unwrap();
    let revenue = &state.nodes[&NodeId::new("REVENUE")];
    assert!(revenue.parent_id.is_none());
    let leaf = &state.nodes[&NodeId::new("REVENUE_4100")];
    assert_eq!(leaf.parent_id, Some(NodeId::new("REVENUE")));
    assert!(leaf.flags.is_leaf);
    let mapping = state.mappings_of(&NodeId::new("REVENUE_4100"))[0];
    assert_eq!(mapping.source_uid.as_deref(), Some("4100"));
    // Two distinct group names, two roots
    assert_eq!(
        state.nodes.values().filter(|n| n.parent_id.is_none()).count(),
        2
    );
}

#[test]
fn given_tier3_file_when_importing_then_ids_flags_and_order_preserved() {
    let (store, builder, project) = setup();
    let file = input(
        &[
            "HIERARCHY_ID",
            "HIERARCHY_NAME",
            "PARENT_ID",
            "DESCRIPTION",
            "INCLUDE_FLAG",
            "EXCLUDE_FLAG",
            "TRANSFORM_FLAG",
            "CALCULATION_FLAG",
            "ACTIVE_FLAG",
            "IS_LEAF_NODE",
            "FORMULA_GROUP",
            "SORT_ORDER",
        ],
        &[
            &["CHILD", "Child", "ROOT", "", "Y", "N", "N", "N", "Y", "Y", "", "2"],
            &["ROOT", "Root", "", "top", "Y", "N", "N", "N", "Y", "N", "", "1"],
        ],
    );

    let report = builder.import_hierarchy(&project, &file, None).unwrap();

    assert_eq!(report.tier, Tier::Tier3);
    assert_eq!(report.dialect, Dialect::Current);
    let state = store.snapshot(&project).unwrap();
    let child = &state.nodes[&NodeId::new("CHILD")];
    assert_eq!(child.parent_id, Some(NodeId::new("ROOT")));
    assert!(child.flags.is_leaf);
    assert_eq!(child.sort_order, 2);
    assert_eq!(state.nodes[&NodeId::new("ROOT")].description, "top");
}

#[test]
fn given_missing_parent_when_importing_then_rejected_naming_row_and_parent() {
    let (store, builder, project) = setup();
    let file = input(
        &[
            "HIERARCHY_ID",
            "HIERARCHY_NAME",
            "PARENT_ID",
            "DESCRIPTION",
            "INCLUDE_FLAG",
            "EXCLUDE_FLAG",
            "TRANSFORM_FLAG",
            "CALCULATION_FLAG",
            "ACTIVE_FLAG",
            "IS_LEAF_NODE",
            "FORMULA_GROUP",
            "SORT_ORDER",
        ],
        &[&[
            "LICENCES", "Licences", "PRODUCT_REV", "", "Y", "N", "N", "N", "Y", "Y", "", "1",
        ]],
    );

    let result = builder.import_hierarchy(&project, &file, None);

    let Err(ApplicationError::ImportRejected { stage, errors }) = result else {
        panic!("expected ImportRejected");
    };
    assert_eq!(stage, ImportStage::Validated);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].row, Some(0));
    assert_eq!(
        errors[0].error,
        DomainError::OrphanParent {
            node: NodeId::new("LICENCES"),
            parent: NodeId::new("PRODUCT_REV"),
        }
    );
    // Nothing committed
    assert!(store.snapshot(&project).unwrap().nodes.is_empty());
}

#[test]
fn given_cycle_within_batch_when_importing_then_zero_nodes_committed() {
    let (store, builder, project) = setup();
    let file = input(
        &[
            "HIERARCHY_ID",
            "HIERARCHY_NAME",
            "PARENT_ID",
            "DESCRIPTION",
            "INCLUDE_FLAG",
            "EXCLUDE_FLAG",
            "TRANSFORM_FLAG",
            "CALCULATION_FLAG",
            "ACTIVE_FLAG",
            "IS_LEAF_NODE",
            "FORMULA_GROUP",
            "SORT_ORDER",
        ],
        &[
            &["A", "A", "B", "", "Y", "N", "N", "N", "Y", "N", "", "1"],
            &["B", "B", "A", "", "Y", "N", "N", "N", "Y", "N", "", "2"],
        ],
    );

    let result = builder.import_hierarchy(&project, &file, None);

    let Err(ApplicationError::ImportRejected { stage, errors }) = result else {
        panic!("expected ImportRejected");
    };
    assert_eq!(stage, ImportStage::Validated);
    assert!(errors
        .iter()
        .any(|e| matches!(e.error, DomainError::CycleDetected(_))));
    let state = store.snapshot(&project).unwrap();
    assert!(state.nodes.is_empty());
    assert_eq!(state.version, 0);
}

#[test]
fn given_duplicate_ids_when_importing_then_both_rows_reported() {
    let (_, builder, project) = setup();
    let file = input(
        &[
            "HIERARCHY_ID",
            "HIERARCHY_NAME",
            "PARENT_ID",
            "DESCRIPTION",
            "INCLUDE_FLAG",
            "EXCLUDE_FLAG",
            "TRANSFORM_FLAG",
            "CALCULATION_FLAG",
            "ACTIVE_FLAG",
            "IS_LEAF_NODE",
            "FORMULA_GROUP",
            "SORT_ORDER",
        ],
        &[
            &["X", "First", "", "", "Y", "N", "N", "N", "Y", "N", "", "1"],
            &["X", "Second", "", "", "Y", "N", "N", "N", "Y", "N", "", "2"],
        ],
    );

    let result = builder.import_hierarchy(&project, &file, None);

    let Err(ApplicationError::ImportRejected { errors, .. }) = result else {
        panic!("expected ImportRejected");
    };
    assert_eq!(
        errors[0].error,
        DomainError::DuplicateId {
            id: NodeId::new("X"),
            first_row: 0,
            second_row: 1,
        }
    );
}

#[test]
fn given_ambiguous_parent_name_when_importing_tier2_then_rejected() {
    let (store, builder, project) = setup();
    // Two committed nodes share the display name "Ops"
    store
        .create_node(
            &project,
            NodeId::new("OPS_EU"),
            None,
            NodeAttrs {
                name: "Ops".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    store
        .create_node(
            &project,
            NodeId::new("OPS_US"),
            None,
            NodeAttrs {
                name: "Ops".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

    let file = input(
        &[
            "HIERARCHY_NAME",
            "PARENT_NAME",
            "DESCRIPTION",
            "SORT_ORDER",
            "SOURCE_UID",
        ],
        &[&["Payroll", "Ops", "", "1", ""]],
    );

    let result = builder.import_hierarchy(&project, &file, None);

    let Err(ApplicationError::ImportRejected { stage, errors }) = result else {
        panic!("expected ImportRejected");
    };
    assert_eq!(stage, ImportStage::Normalized);
    assert!(matches!(
        errors[0].error,
        DomainError::AmbiguousParent { .. }
    ));
}

#[test]
fn given_tier2_file_when_importing_then_parents_linked_by_name() {
    let (store, builder, project) = setup();
    let file = input(
        &[
            "HIERARCHY_NAME",
            "PARENT_NAME",
            "DESCRIPTION",
            "SORT_ORDER",
            "SOURCE_UID",
        ],
        &[
            &["Revenue", "", "", "1", ""],
            &["Licences", "Revenue", "", "1", "LIC-%"],
        ],
    );

    let report = builder.import_hierarchy(&project, &file, None).unwrap();

    assert_eq!(report.tier, Tier::Tier2);
    assert_eq!(report.mappings, 1);
    let state = store.snapshot(&project).unwrap();
    let licences = &state.nodes[&NodeId::new("LICENCES")];
    assert_eq!(licences.parent_id, Some(NodeId::new("REVENUE")));
    let mapping = state.mappings_of(&NodeId::new("LICENCES"))[0];
    assert_eq!(mapping.source_uid.as_deref(), Some("LIC-%"));
}

#[test]
fn given_groups_without_alphanumerics_when_importing_tier1_then_rejected() {
    let (store, builder, project) = setup();
    // "---" and "###" would both slug to the empty id and merge
    let file = input(
        &["SRC_VAL", "GRP_NAME"],
        &[&["4100", "---"], &["4200", "###"]],
    );

    let result = builder.import_hierarchy(&project, &file, None);

    let Err(ApplicationError::ImportRejected { stage, errors }) = result else {
        panic!("expected ImportRejected");
    };
    assert_eq!(stage, ImportStage::Normalized);
    assert_eq!(errors.len(), 2);
    assert!(errors
        .iter()
        .all(|e| matches!(e.error, DomainError::MalformedInput(_))));
    assert!(store.snapshot(&project).unwrap().nodes.is_empty());
}

#[test]
fn given_garbage_headers_when_importing_then_format_ambiguous_listed() {
    let (_, builder, project) = setup();
    let headers: Vec<String> = (0..10).map(|i| format!("ZZZ_{i}")).collect();
    let file = TabularInput::new(headers, vec![]);

    let result = builder.import_hierarchy(&project, &file, None);

    let Err(ApplicationError::ImportRejected { stage, errors }) = result else {
        panic!("expected ImportRejected");
    };
    assert_eq!(stage, ImportStage::FormatDetected);
    match &errors[0].error {
        DomainError::FormatAmbiguous { unmatched, .. } => assert!(!unmatched.is_empty()),
        other => panic!("expected FormatAmbiguous, got {other:?}"),
    }
}

#[test]
fn given_mapping_file_when_importing_then_attached_by_id() {
    let (store, builder, project) = setup();
    store
        .create_node(
            &project,
            NodeId::new("LICENCES"),
            None,
            NodeAttrs {
                name: "Licences".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

    let file = input(
        &[
            "HIERARCHY_ID",
            "MAPPING_INDEX",
            "SOURCE_TABLE",
            "SOURCE_UID",
            "PRECEDENCE_GROUP",
        ],
        &[&["LICENCES", "3", "GL", "LIC-%", "2"]],
    );

    let report = builder.import_mappings(&project, &file).unwrap();

    assert_eq!(report.mappings, 1);
    let state = store.snapshot(&project).unwrap();
    let mapping = state.mappings_of(&NodeId::new("LICENCES"))[0];
    assert_eq!(mapping.mapping_index, 3);
    assert_eq!(mapping.precedence_group, "2");
    assert_eq!(mapping.coords.table.as_deref(), Some("GL"));
}

#[test]
fn given_mapping_file_with_unknown_node_when_importing_then_rejected() {
    let (store, builder, project) = setup();

    let file = input(
        &[
            "HIERARCHY_ID",
            "MAPPING_INDEX",
            "SOURCE_TABLE",
            "SOURCE_UID",
            "PRECEDENCE_GROUP",
        ],
        &[&["NOBODY", "1", "GL", "X", "1"]],
    );

    let result = builder.import_mappings(&project, &file);

    let Err(ApplicationError::ImportRejected { stage, errors }) = result else {
        panic!("expected ImportRejected");
    };
    assert_eq!(stage, ImportStage::Validated);
    assert_eq!(errors[0].error, DomainError::UnknownNode(NodeId::new("NOBODY")));
    assert!(store.snapshot(&project).unwrap().mappings.is_empty());
}

#[test]
fn given_mapping_file_with_sort_column_when_importing_then_node_sort_untouched() {
    let (store, builder, project) = setup();
    store
        .create_node(
            &project,
            NodeId::new("LICENCES"),
            None,
            NodeAttrs {
                name: "Licences".to_string(),
                sort_order: 7,
                ..Default::default()
            },
        )
        .unwrap();

    // A stray sort column in the mapping file must be ignored entirely
    let file = input(
        &[
            "HIERARCHY_ID",
            "MAPPING_INDEX",
            "SOURCE_TABLE",
            "SOURCE_UID",
            "PRECEDENCE_GROUP",
            "SORT_ORDER",
        ],
        &[&["LICENCES", "1", "GL", "LIC-%", "1", "999"]],
    );

    let report = builder.import_mappings(&project, &file).unwrap();

    assert_eq!(report.mappings, 1);
    let state = store.snapshot(&project).unwrap();
    assert_eq!(state.nodes[&NodeId::new("LICENCES")].sort_order, 7);
}
