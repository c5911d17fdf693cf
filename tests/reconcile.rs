// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use serde_json::{Value, json};
use sptree::{
    AllowAll, ConflictNote, Conflicts, DataObjectConflict, Factory, MergePolicy, Node, NodeKey,
    NodeKind, Perspective, ProgramTree, merge_remote,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn defaults() -> Factory<Value> {
    Factory::with_defaults(|ctype| json!({ "type": ctype.name }))
}

#[test]
fn concurrent_payload_edits_leave_one_conflict_until_resolved() {
    init_tracing();
    let factory = defaults();
    let mut b = factory
        .create_program(None, Some("GN-2025B-Q-12".into()))
        .unwrap();
    let obs = factory.create_observation(&mut b, None).unwrap();
    b.add_child(b.root(), obs).unwrap();
    let mut a = factory.copy_with_new_lifespan_id(&b).unwrap();
    assert_eq!(a.version(obs), b.version(obs));

    a.set_data_object(obs, json!({ "title": "V1" })).unwrap();
    b.set_data_object(obs, json!({ "title": "V2" })).unwrap();
    assert!(a.version(obs).unwrap().concurrent_with(b.version(obs).unwrap()));

    let report = merge_remote(&factory, &mut b, &a, &AllowAll).unwrap();
    assert_eq!(report.conflicted, vec![obs]);
    assert!(b.has_conflicts(obs));
    let recorded = b.conflicts(obs).unwrap().clone();
    assert!(recorded.notes().is_empty());
    assert_eq!(
        recorded.data_object_conflict(),
        Some(&DataObjectConflict::remote(json!({ "title": "V1" })))
    );

    // Merging the same remote again changes nothing.
    merge_remote(&factory, &mut b, &a, &AllowAll).unwrap();
    assert_eq!(b.conflicts(obs).unwrap(), &recorded);

    // Conflicts arriving later replace the recorded payload conflict.
    let later = Conflicts::EMPTY
        .with_data_object_conflict(DataObjectConflict::local(json!({ "title": "V3" })));
    let merged = b.conflicts(obs).unwrap().merge_from(&later);
    assert_eq!(
        merged.data_object_conflict().map(|d| d.perspective),
        Some(Perspective::Local)
    );

    // Taking the other side swaps the payloads; the conflict stays until resolved.
    assert!(b.swap_data_object_conflict(obs).unwrap());
    assert_eq!(
        b.get(obs).unwrap().data_object(),
        &json!({ "title": "V1" })
    );
    assert!(b.has_conflicts(obs));
    b.resolve_data_object_conflict(obs).unwrap();
    assert!(!b.has_conflicts(obs));
    assert!(b.conflicted_nodes().is_empty());
}

#[test]
fn offline_session_is_folded_back_in() {
    init_tracing();
    let factory = defaults();
    let mut local = factory.create_program(None, None).unwrap();
    let root = local.root();
    let first = factory.create_observation(&mut local, None).unwrap();
    let second = factory.create_observation(&mut local, None).unwrap();
    local.add_child(root, first).unwrap();
    local.add_child(root, second).unwrap();

    // Offline: group the second observation and retitle the first.
    let mut offline = factory.copy_with_new_lifespan_id(&local).unwrap();
    let group = factory.create_group(&mut offline, None).unwrap();
    offline.add_child(root, group).unwrap();
    offline.remove_child(root, second).unwrap();
    offline.add_child(group, second).unwrap();
    offline
        .set_data_object(first, json!({ "title": "offline" }))
        .unwrap();

    // Meanwhile, at home.
    local
        .set_data_object(first, json!({ "title": "home" }))
        .unwrap();

    let report = merge_remote(&factory, &mut local, &offline, &AllowAll).unwrap();
    assert_eq!(report.created, vec![group]);
    assert_eq!(report.moved, vec![second]);
    assert_eq!(report.conflicted, {
        let mut expected = vec![root, first];
        expected.sort();
        expected
    });
    assert_eq!(
        local.conflicts(root).unwrap().notes(),
        &[ConflictNote::Moved {
            node: second,
            to: group
        }]
    );
    insta::assert_snapshot!(local.outline(), @r"
    Program !
      Observation !
        Base
      Group
        Observation
          Base
    ");

    // Once both sides have exchanged everything, the other direction is quiet too.
    let mut back = factory.copy_with_new_lifespan_id(&local).unwrap();
    let report = merge_remote(&factory, &mut back, &local, &AllowAll).unwrap();
    assert!(report.updated.is_empty() && report.created.is_empty() && report.moved.is_empty());
    assert_eq!(back.outline(), local.outline());
}

struct NoGroups;

impl MergePolicy<Value> for NoGroups {
    fn can_create(&self, _: &ProgramTree<Value>, _: NodeKey, node: &Node<Value>) -> bool {
        node.kind() != NodeKind::Group
    }
}

#[test]
fn refused_parents_leave_their_children_in_the_conflict_folder() {
    init_tracing();
    let factory = defaults();
    let mut local = factory.create_program(None, None).unwrap();
    let root = local.root();
    let mut remote = factory.copy_with_new_lifespan_id(&local).unwrap();
    let group = factory.create_group(&mut remote, None).unwrap();
    remote.add_child(root, group).unwrap();
    let obs = factory.create_observation(&mut remote, None).unwrap();
    remote.add_child(group, obs).unwrap();

    let report = merge_remote(&factory, &mut local, &remote, &NoGroups).unwrap();
    let folder = local.conflict_folder().unwrap();
    assert_eq!(report.created, vec![obs, remote.seq_component(obs).unwrap()]);
    assert_eq!(report.conflicted, {
        let mut expected = vec![root, folder];
        expected.sort();
        expected
    });
    assert_eq!(
        local.conflicts(root).unwrap().notes(),
        &[ConflictNote::CreatePermissionFail { node: root }]
    );
    assert_eq!(
        local.conflicts(folder).unwrap().notes(),
        &[ConflictNote::ConflictFolder { node: folder }]
    );
    assert_eq!(local.children(folder), &[obs]);
    assert!(!local.has_seen(group));

    // The group was never taken in, so a merge that allows it brings it back.
    let report = merge_remote(&factory, &mut local, &remote, &AllowAll).unwrap();
    assert_eq!(report.created, vec![group]);
    assert_eq!(report.moved, vec![obs]);
    assert_eq!(local.parent(obs), Some(group));
    assert!(local.children(folder).is_empty());
}

#[test]
fn two_conflict_folders_become_one() {
    init_tracing();
    let factory = defaults();
    let mut local = factory.create_program(None, None).unwrap();
    let root = local.root();
    let mut remote = factory.copy_with_new_lifespan_id(&local).unwrap();

    let ours = factory.create_conflict_folder(&mut local, None).unwrap();
    local.set_conflict_folder(Some(ours)).unwrap();
    let theirs = factory.create_conflict_folder(&mut remote, None).unwrap();
    remote.set_conflict_folder(Some(theirs)).unwrap();
    let stray = factory.create_observation(&mut remote, None).unwrap();
    remote.add_child(theirs, stray).unwrap();
    remote
        .set_data_object(stray, json!({ "title": "left over" }))
        .unwrap();

    let report = merge_remote(&factory, &mut local, &remote, &AllowAll).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.created, vec![stray, remote.seq_component(stray).unwrap()]);
    assert_eq!(local.conflict_folder(), Some(ours));
    assert_eq!(local.children(ours), &[stray]);
    assert_eq!(
        local.get(stray).unwrap().data_object(),
        &json!({ "title": "left over" })
    );
    assert!(!local.contains(theirs));
    assert!(!local.has_seen(theirs));
    assert!(local.children_of_kind(root, NodeKind::ConflictFolder).len() == 1);

    // Merging again finds everything in place.
    let report = merge_remote(&factory, &mut local, &remote, &AllowAll).unwrap();
    assert_eq!(report, Default::default());
    assert_eq!(local.children(ours), &[stray]);
}
