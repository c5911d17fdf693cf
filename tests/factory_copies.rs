// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use quickcheck_macros::quickcheck;
use serde_json::{Value, json};
use sptree::{ComponentType, Factory, NodeKind, ProgramId, ProgramTree};
use std::collections::HashSet;

fn defaults() -> Factory<Value> {
    Factory::with_defaults(|ctype| json!({ "type": ctype.name }))
}

/// Grows a program from a list of instructions: groups hang off the root, observations off the
/// latest group, and instruments off the latest observation.
fn grow(factory: &Factory<Value>, shape: &[u8]) -> ProgramTree<Value> {
    let mut tree = factory
        .create_program(None, Some("GS-2026A-Q-3".into()))
        .unwrap();
    let mut group = tree.root();
    let mut obs = None;
    for (i, step) in shape.iter().enumerate() {
        match step % 3 {
            0 => {
                group = factory.create_group(&mut tree, None).unwrap();
                tree.add_child(tree.root(), group).unwrap();
            }
            1 => {
                let o = factory.create_observation(&mut tree, None).unwrap();
                tree.add_child(group, o).unwrap();
                tree.set_data_object(o, json!({ "step": i })).unwrap();
                obs = Some(o);
            }
            _ => {
                let Some(o) = obs else { continue };
                let ctype = ComponentType::new(NodeKind::ObsComponent, format!("Instrument:{i}"));
                let c = factory.create_obs_component(&mut tree, ctype, None).unwrap();
                tree.add_child(o, c).unwrap();
            }
        }
    }
    tree
}

fn payloads(tree: &ProgramTree<Value>) -> Vec<Value> {
    tree.subtree(tree.root())
        .into_iter()
        .map(|k| tree.get(k).unwrap().data_object().clone())
        .collect()
}

#[quickcheck]
fn same_keys_copy_has_the_same_keys(shape: Vec<u8>) -> bool {
    let factory = defaults();
    let tree = grow(&factory, &shape);
    let copy = factory.copy_with_same_keys(&tree).unwrap();
    copy.subtree(copy.root()) == tree.subtree(tree.root())
        && copy.outline() == tree.outline()
        && payloads(&copy) == payloads(&tree)
}

#[quickcheck]
fn new_keys_copy_is_isomorphic_and_disjoint(shape: Vec<u8>) -> bool {
    let factory = defaults();
    let tree = grow(&factory, &shape);
    let copy = factory
        .copy_with_new_keys(&tree, Some(ProgramId::new("GS-2026A-Q-4")))
        .unwrap();

    let original: HashSet<_> = tree.subtree(tree.root()).into_iter().collect();
    let disjoint = copy.subtree(copy.root()).iter().all(|k| !original.contains(k));
    disjoint
        && copy.outline() == tree.outline()
        && payloads(&copy) == payloads(&tree)
        && copy.program_id().map(ProgramId::as_str) == Some("GS-2026A-Q-4")
}

#[test]
fn mutating_a_copy_leaves_the_source_alone() {
    let factory = defaults();
    let tree = grow(&factory, &[0, 1, 2, 1]);
    let before = payloads(&tree);
    let outline = tree.outline();

    let mut copy = factory.copy_with_same_keys(&tree).unwrap();
    let obs = copy.observations(copy.root()).next().unwrap();
    copy.set_data_object(obs, json!({ "title": "changed" }))
        .unwrap();
    let group = copy.parent(obs).unwrap();
    copy.remove_child(group, obs).unwrap();

    assert_eq!(payloads(&tree), before);
    assert_eq!(tree.outline(), outline);
    assert_eq!(tree.get(obs).unwrap().parent(), Some(group));
}

#[test]
fn copies_of_copies_stay_registered() {
    let factory = defaults();
    let tree = grow(&factory, &[0, 1]);
    let mut copy = factory.copy_with_new_keys(&tree, None).unwrap();
    assert!(factory.knows_program(copy.root()));
    let group = factory.create_group(&mut copy, None).unwrap();
    copy.add_child(copy.root(), group).unwrap();
    assert_eq!(copy.program_id(), None);
}
