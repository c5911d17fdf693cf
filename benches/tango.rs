// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use serde_json::{Value, json};
use sptree::{
    AllowAll, DataObjectBlob, Factory, LifespanId, NodeKey, NodeKeyLocks, ProgramTree,
    VersionVector, merge_remote,
};
use std::hint::black_box;
use tango_bench::{IntoBenchmarks, benchmark_fn, tango_benchmarks, tango_main};

fn defaults() -> Factory<Value> {
    Factory::with_defaults(|ctype| json!({ "type": ctype.name }))
}

/// A program of `groups` groups with `per_group` observations each.
fn program(factory: &Factory<Value>, groups: usize, per_group: usize) -> ProgramTree<Value> {
    let mut tree = factory.create_program(None, None).unwrap();
    for g in 0..groups {
        let group = factory.create_group(&mut tree, None).unwrap();
        tree.add_child(tree.root(), group).unwrap();
        for o in 0..per_group {
            let obs = factory.create_observation(&mut tree, None).unwrap();
            tree.add_child(group, obs).unwrap();
            tree.set_data_object(obs, json!({ "title": format!("obs {g}.{o}"), "exposures": o }))
                .unwrap();
        }
    }
    tree
}

fn blob_benchmarks() -> impl IntoBenchmarks {
    let small = json!({ "title": "M31", "ra": 10.684, "dec": 41.269 });
    let big = json!({
        "title": "M31",
        "steps": (0..256).map(|i| json!({ "filter": "r", "exposure": i })).collect::<Vec<_>>(),
    });
    let small: &'static _ = Box::leak(Box::new(small));
    let big: &'static _ = Box::leak(Box::new(big));
    [
        benchmark_fn("blob::same::small", move |b| {
            b.iter(move || DataObjectBlob::same(Some(black_box(small)), Some(black_box(small))))
        }),
        benchmark_fn("blob::same::big", move |b| {
            b.iter(move || DataObjectBlob::same(Some(black_box(big)), Some(black_box(big))))
        }),
    ]
}

fn version_benchmarks() -> impl IntoBenchmarks {
    let sessions: Vec<_> = (0..16).map(|_| LifespanId::new()).collect();
    let left: VersionVector = sessions.iter().map(|&s| (s, 3)).collect();
    let right: VersionVector = sessions.iter().skip(4).map(|&s| (s, 5)).collect();
    let left: &'static _ = Box::leak(Box::new(left));
    let right: &'static _ = Box::leak(Box::new(right));
    [
        benchmark_fn("version::compare", move |b| {
            b.iter(move || black_box(left).partial_cmp(black_box(right)))
        }),
        benchmark_fn("version::join", move |b| {
            b.iter(move || black_box(left).joined(black_box(right)))
        }),
    ]
}

fn tree_benchmarks() -> impl IntoBenchmarks {
    let factory: &'static _ = Box::leak(Box::new(defaults()));
    let tree: &'static _ = Box::leak(Box::new(program(factory, 16, 16)));
    [
        benchmark_fn("tree::copy_with_same_keys", move |b| {
            b.iter(move || factory.copy_with_same_keys(black_box(tree)).unwrap())
        }),
        benchmark_fn("tree::copy_with_new_keys", move |b| {
            b.iter(move || factory.copy_with_new_keys(black_box(tree), None).unwrap())
        }),
        benchmark_fn("tree::observations", move |b| {
            b.iter(move || black_box(tree).observations(tree.root()).count())
        }),
    ]
}

fn merge_benchmarks() -> impl IntoBenchmarks {
    let factory: &'static _ = Box::leak(Box::new(defaults()));
    let local = program(factory, 16, 16);
    let mut remote = factory.copy_with_new_lifespan_id(&local).unwrap();
    let edited: Vec<_> = remote.observations(remote.root()).step_by(4).collect();
    for obs in edited {
        remote.set_data_object(obs, json!({ "title": "edited offline" })).unwrap();
    }
    let untouched = factory.copy_with_new_lifespan_id(&local).unwrap();

    let local: &'static _ = Box::leak(Box::new(local));
    let remote: &'static _ = Box::leak(Box::new(remote));
    let untouched: &'static _ = Box::leak(Box::new(untouched));
    [
        // Both include copying the local tree, which the merge mutates.
        benchmark_fn("merge::identical", move |b| {
            b.iter(move || {
                let mut target = factory.copy_with_same_keys(local).unwrap();
                merge_remote(factory, &mut target, black_box(untouched), &AllowAll).unwrap()
            })
        }),
        benchmark_fn("merge::quarter_edited", move |b| {
            b.iter(move || {
                let mut target = factory.copy_with_same_keys(local).unwrap();
                merge_remote(factory, &mut target, black_box(remote), &AllowAll).unwrap()
            })
        }),
    ]
}

fn lock_benchmarks() -> impl IntoBenchmarks {
    let locks: &'static _ = Box::leak(Box::new(NodeKeyLocks::new()));
    let key = NodeKey::new();
    [
        benchmark_fn("locks::write", move |b| {
            b.iter(move || drop(locks.write(black_box(key))))
        }),
        benchmark_fn("locks::read", move |b| {
            b.iter(move || drop(locks.read(black_box(key))))
        }),
    ]
}

tango_benchmarks!(
    blob_benchmarks(),
    version_benchmarks(),
    tree_benchmarks(),
    merge_benchmarks(),
    lock_benchmarks()
);
tango_main!();
