// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use parking_lot::Mutex;
use serde_json::{Value, json};
use sptree::{
    ComponentType, Factory, NodeKind, ProcessId, ProgramTree, PropertyChange, TreeError,
    event::{DATA_OBJECT_PROP, EVENTS_ACTIVATED},
};
use std::sync::Arc;

fn defaults() -> Factory<Value> {
    Factory::with_defaults(|ctype| json!({ "type": ctype.name }))
}

fn program(factory: &Factory<Value>) -> ProgramTree<Value> {
    factory
        .create_program(None, Some("GS-2025B-Q-7".into()))
        .unwrap()
}

#[test]
fn build_a_small_program() {
    let factory = defaults();
    let mut tree = program(&factory);

    let group = factory.create_group(&mut tree, None).unwrap();
    tree.add_child(tree.root(), group).unwrap();
    let mut observations = Vec::new();
    for _ in 0..3 {
        let obs = factory.create_observation(&mut tree, None).unwrap();
        tree.add_child(group, obs).unwrap();
        observations.push(obs);
    }
    let instrument = factory
        .create_obs_component(
            &mut tree,
            ComponentType::new(NodeKind::ObsComponent, "Instrument:GMOS-N"),
            None,
        )
        .unwrap();
    tree.add_child(observations[0], instrument).unwrap();

    assert_eq!(tree.children(group), &observations[..]);
    assert_eq!(tree.parent(instrument), Some(observations[0]));
    assert_eq!(
        tree.observations(tree.root()).collect::<Vec<_>>(),
        observations
    );
    assert!(tree.seq_component(observations[1]).is_some());
    insta::assert_snapshot!(tree.outline(), @r"
    Program
      Group
        Observation
          Base
          Instrument:GMOS-N
        Observation
          Base
        Observation
          Base
    ");
}

#[test]
fn placing_a_placed_node_leaves_both_parents_alone() {
    let factory = defaults();
    let mut tree = program(&factory);
    let g1 = factory.create_group(&mut tree, None).unwrap();
    let g2 = factory.create_group(&mut tree, None).unwrap();
    tree.add_child(tree.root(), g1).unwrap();
    tree.add_child(tree.root(), g2).unwrap();
    let obs = factory.create_observation(&mut tree, None).unwrap();
    tree.add_child(g1, obs).unwrap();

    let before = tree.outline();
    let v1 = tree.version(g1).cloned();
    let v2 = tree.version(g2).cloned();
    assert_eq!(tree.add_child(g2, obs), Err(TreeError::AlreadyPlaced(obs)));
    assert_eq!(tree.outline(), before);
    assert_eq!(tree.version(g1).cloned(), v1);
    assert_eq!(tree.version(g2).cloned(), v2);
    assert_eq!(tree.children(g1), &[obs]);
    assert!(tree.children(g2).is_empty());
}

#[test]
fn nodes_of_other_processes_cannot_be_placed() {
    let factory = defaults();
    let mut tree = program(&factory);

    // The same program, as seen by another process.
    let elsewhere = defaults().with_origin(ProcessId::new());
    let mut remote = elsewhere
        .create_program(Some(tree.root()), tree.program_id().cloned())
        .unwrap();
    let obs = elsewhere.create_observation(&mut remote, None).unwrap();

    tree.adopt_foreign(&remote, obs).unwrap();
    assert!(tree.contains(obs));
    assert!(!tree.is_local(obs));
    assert_eq!(
        tree.add_child(tree.root(), obs),
        Err(TreeError::NotLocal(obs))
    );
    // Locality is reported before placement, even for a foreign node that has a parent.
    let seq = tree.seq_component(obs).unwrap();
    assert_eq!(tree.add_child(tree.root(), seq), Err(TreeError::NotLocal(seq)));
    assert!(tree.children(tree.root()).is_empty());

    // A copy made through the local factory is fine.
    let copy = factory
        .copy_subtree_with_new_keys(&remote, obs, &mut tree)
        .unwrap();
    tree.add_child(tree.root(), copy).unwrap();
    assert_eq!(tree.children(tree.root()), &[copy]);
}

#[test]
fn listeners_see_payload_and_structure_changes() {
    let factory = defaults();
    let mut tree = program(&factory);
    let group = factory.create_group(&mut tree, None).unwrap();
    tree.add_child(tree.root(), group).unwrap();
    let obs = factory.create_observation(&mut tree, None).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    tree.add_composite_listener(
        tree.root(),
        Arc::new(move |change: &PropertyChange<Value>| {
            log.lock()
                .push((change.property.to_string(), change.source, change.structural));
        }),
    )
    .unwrap();

    tree.add_child(group, obs).unwrap();
    tree.set_data_object(obs, json!({ "title": "NGC 1068" }))
        .unwrap();

    let seen = seen.lock().clone();
    assert_eq!(
        seen,
        vec![
            ("ObservationList".to_string(), group, true),
            (DATA_OBJECT_PROP.to_string(), obs, false),
        ]
    );
}

#[test]
fn suspending_events_collapses_them_into_one_activation() {
    let factory = defaults();
    let mut tree = program(&factory);
    let obs = factory.create_observation(&mut tree, None).unwrap();
    tree.add_child(tree.root(), obs).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    tree.add_composite_listener(
        tree.root(),
        Arc::new(move |change: &PropertyChange<Value>| {
            log.lock().push(change.property.to_string());
        }),
    )
    .unwrap();

    tree.set_sending_events(false);
    for i in 0..10 {
        tree.set_data_object(obs, json!({ "exposures": i })).unwrap();
    }
    assert!(seen.lock().is_empty());
    tree.set_sending_events(true);
    assert_eq!(*seen.lock(), vec![EVENTS_ACTIVATED.to_string()]);
}
