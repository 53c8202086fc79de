//! Tests for mapping resolution and inheritance views

use hierbase::application::services::resolver::MappingResolver;
use hierbase::application::services::store::Store;
use hierbase::domain::entities::{MappingAttrs, NodeAttrs, NodeId, ProjectId, SourceCoords};
use hierbase::domain::error::DomainError;
use hierbase::util::testing::init_test_setup;
use hierbase::ApplicationError;

fn attrs(name: &str) -> NodeAttrs {
    NodeAttrs {
        name: name.to_string(),
        ..Default::default()
    }
}

fn mapping(precedence: &str) -> MappingAttrs {
    MappingAttrs {
        precedence_group: Some(precedence.to_string()),
        ..Default::default()
    }
}

/// Revenue -> Product -> Licences (2 mappings), Product -> Services
/// (1 mapping); one mapping directly on Revenue.
fn setup() -> (Store, ProjectId) {
    init_test_setup();
    let store = Store::with_defaults();
    let project = store
        .create_project("Views KB", SourceCoords::default())
        .unwrap();

    store
        .create_node(&project, NodeId::new("REVENUE"), None, attrs("Revenue"))
        .unwrap();
    store
        .create_node(
            &project,
            NodeId::new("PRODUCT"),
            Some(NodeId::new("REVENUE")),
            attrs("Product"),
        )
        .unwrap();
    store
        .create_node(
            &project,
            NodeId::new("LICENCES"),
            Some(NodeId::new("PRODUCT")),
            attrs("Licences"),
        )
        .unwrap();
    store
        .create_node(
            &project,
            NodeId::new("SERVICES"),
            Some(NodeId::new("PRODUCT")),
            attrs("Services"),
        )
        .unwrap();

    store
        .add_mapping(&project, &NodeId::new("REVENUE"), mapping("1"))
        .unwrap();
    store
        .add_mapping(&project, &NodeId::new("LICENCES"), mapping("1"))
        .unwrap();
    store
        .add_mapping(&project, &NodeId::new("LICENCES"), mapping("2"))
        .unwrap();
    store
        .add_mapping(&project, &NodeId::new("SERVICES"), mapping("1"))
        .unwrap();
    (store, project)
}

#[test]
fn given_subtree_mappings_when_resolving_ancestor_then_all_inherited() {
    let (store, project) = setup();
    let state = store.snapshot(&project).unwrap();
    let resolver = MappingResolver::new();

    let view = resolver
        .inherited_mappings(&state, &NodeId::new("REVENUE"))
        .unwrap();

    assert_eq!(view.own_count, 1);
    assert_eq!(view.entries.len(), 3);
    assert_eq!(view.total, 4);
    let licence_entry = view
        .entries
        .iter()
        .find(|e| e.owner == NodeId::new("LICENCES"))
        .unwrap();
    assert_eq!(
        licence_entry.path,
        vec!["Revenue", "Product", "Licences"]
    );
    assert_eq!(licence_entry.path_display(), "Revenue / Product / Licences");
}

#[test]
fn given_leaf_node_when_resolving_then_nothing_inherited_downward() {
    let (store, project) = setup();
    let state = store.snapshot(&project).unwrap();
    let resolver = MappingResolver::new();

    // Inheritance is strictly upward: the mapping on Revenue must not
    // surface on any descendant's view.
    let view = resolver
        .inherited_mappings(&state, &NodeId::new("LICENCES"))
        .unwrap();

    assert_eq!(view.own_count, 2);
    assert!(view.entries.is_empty());
    assert_eq!(view.total, 2);
}

#[test]
fn given_intermediate_node_when_resolving_then_child_breakdown_counts() {
    let (store, project) = setup();
    let state = store.snapshot(&project).unwrap();
    let resolver = MappingResolver::new();

    let view = resolver
        .inherited_mappings(&state, &NodeId::new("PRODUCT"))
        .unwrap();

    assert_eq!(view.own_count, 0);
    assert_eq!(view.entries.len(), 3);
    let licences = view
        .children
        .iter()
        .find(|c| c.child == NodeId::new("LICENCES"))
        .unwrap();
    assert_eq!(licences.direct_count, 2);
    assert_eq!(licences.deeper_count, 0);
    assert_eq!(licences.subtree_total(), 2);
}

#[test]
fn given_precedence_groups_when_summarizing_then_split_by_group() {
    let (store, project) = setup();
    let state = store.snapshot(&project).unwrap();
    let resolver = MappingResolver::new();

    let summary = resolver
        .mapping_summary(&state, &NodeId::new("REVENUE"))
        .unwrap();

    assert_eq!(summary.own, 1);
    assert_eq!(summary.inherited, 3);
    assert_eq!(summary.by_precedence["1"].own, 1);
    assert_eq!(summary.by_precedence["1"].inherited, 2);
    assert_eq!(summary.by_precedence["2"].inherited, 1);
}

#[test]
fn given_precedence_view_when_resolving_then_groups_cover_subtree() {
    let (store, project) = setup();
    let state = store.snapshot(&project).unwrap();
    let resolver = MappingResolver::new();

    let view = resolver
        .precedence_view(&state, &NodeId::new("REVENUE"))
        .unwrap();

    assert_eq!(view.groups["1"].len(), 3);
    assert_eq!(view.groups["2"].len(), 1);
}

#[test]
fn given_unknown_node_when_resolving_then_errors() {
    let (store, project) = setup();
    let state = store.snapshot(&project).unwrap();
    let resolver = MappingResolver::new();

    let result = resolver.inherited_mappings(&state, &NodeId::new("NOBODY"));

    assert!(matches!(
        result,
        Err(ApplicationError::Domain(DomainError::UnknownNode(_)))
    ));
}

#[test]
fn given_own_mappings_when_resolving_then_grouped_and_counted() {
    let (store, project) = setup();
    let state = store.snapshot(&project).unwrap();
    let resolver = MappingResolver::new();

    let own = resolver
        .own_mappings(&state, &NodeId::new("LICENCES"))
        .unwrap();

    assert_eq!(own.count(), 2);
    assert_eq!(own.groups.len(), 2);
    assert!(own.groups.contains_key("1"));
    assert!(own.groups.contains_key("2"));
}
