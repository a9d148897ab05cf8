//! Containers shared between genuinely separate processes
//!
//! Each test re-runs this test binary with `child_entry` selected and a role
//! in the environment, so the children are independent OS processes that
//! only meet through the container name.

use rememory::{ContainerStore, SharedCell, SharedList, SharedMap, StoreConfig, Value};
use std::process::{Child, Command};
use std::time::Duration;

const ROLE_ENV: &str = "REMEMORY_TEST_ROLE";
const NAME_ENV: &str = "REMEMORY_TEST_NAME";
const ARG_ENV: &str = "REMEMORY_TEST_ARG";

fn store() -> ContainerStore {
    ContainerStore::new(
        StoreConfig::default()
            .with_initial_capacity(64)
            .with_lock_timeout(Duration::from_secs(60)),
    )
}

fn unique(tag: &str) -> String {
    format!("mptest_{}_{}", tag, std::process::id())
}

fn spawn(role: &str, name: &str, arg: usize) -> Child {
    Command::new(std::env::current_exe().unwrap())
        .args(["child_entry", "--exact", "--nocapture", "--test-threads=1"])
        .env(ROLE_ENV, role)
        .env(NAME_ENV, name)
        .env(ARG_ENV, arg.to_string())
        .spawn()
        .unwrap()
}

fn wait_all(children: Vec<Child>) {
    for mut child in children {
        let status = child.wait().unwrap();
        assert!(status.success(), "child process failed: {}", status);
    }
}

/// Entry point for child processes; a no-op in the parent run
#[test]
fn child_entry() {
    let Ok(role) = std::env::var(ROLE_ENV) else {
        return;
    };
    let name = std::env::var(NAME_ENV).unwrap();
    let arg: usize = std::env::var(ARG_ENV).unwrap().parse().unwrap();
    let store = store();

    match role.as_str() {
        "map_set" => {
            let map: SharedMap<String, i64> = SharedMap::open(&store, &name).unwrap();
            map.insert("x".into(), 1).unwrap();
        }
        "map_get" => {
            let map: SharedMap<String, i64> = SharedMap::open(&store, &name).unwrap();
            assert_eq!(map.get("x".into()).unwrap(), 1);
        }
        "increment" => {
            let counter = SharedCell::open(&store, &name, 0i32).unwrap();
            for _ in 0..arg {
                counter.increment(1).unwrap();
            }
        }
        "append" => {
            let list: SharedList<String> = SharedList::open(&store, &name).unwrap();
            let pid = std::process::id();
            for i in 0..arg {
                list.push(format!("{}:{}", pid, i)).unwrap();
            }
        }
        "overwrite" => {
            let handle = store
                .open(&name, rememory::ContainerKind::Sequence.default_value())
                .unwrap();
            let marker = Value::Int(arg as i64);
            for round in 0..100 {
                handle
                    .modify(|v| {
                        let seq = v.as_sequence_mut()?;
                        seq.clear();
                        seq.extend(std::iter::repeat(marker.clone()).take(200 + round));
                        Ok(())
                    })
                    .unwrap();
                let snapshot = handle.snapshot().unwrap().into_elements().unwrap();
                let first = snapshot.first().cloned();
                assert!(snapshot.iter().all(|v| Some(v) == first.as_ref()));
            }
        }
        other => panic!("unknown role {}", other),
    }
}

#[test]
fn test_map_write_then_read_in_other_processes() {
    let store = store();
    let name = unique("d1");
    let map: SharedMap<String, i64> = SharedMap::open(&store, &name).unwrap();

    wait_all(vec![spawn("map_set", &name, 0)]);
    wait_all(vec![spawn("map_get", &name, 0)]);
    assert_eq!(map.get("x".into()).unwrap(), 1);

    map.destroy().unwrap();
}

#[test]
fn test_no_lost_updates_across_processes() {
    let store = store();
    let name = unique("counter");
    let counter = SharedCell::open(&store, &name, 0i32).unwrap();

    let children = (0..10).map(|_| spawn("increment", &name, 1000)).collect();
    wait_all(children);

    assert_eq!(counter.get().unwrap(), 10_000);
    counter.destroy().unwrap();
}

#[test]
fn test_concurrent_appends_grow_without_loss() {
    let store = store();
    let name = unique("appends");
    let list: SharedList<String> = SharedList::open(&store, &name).unwrap();
    let start_generation = list.handle().info().generation;

    let children = (0..4).map(|_| spawn("append", &name, 250)).collect();
    wait_all(children);

    let items = list.to_vec().unwrap();
    assert_eq!(items.len(), 1000);
    assert!(list.handle().info().generation > start_generation);

    // Each writer's elements appear in its own order
    let mut next: std::collections::HashMap<&str, usize> = Default::default();
    for item in &items {
        let (pid, seq) = item.split_once(':').unwrap();
        let expected = next.entry(pid).or_insert(0);
        assert_eq!(seq.parse::<usize>().unwrap(), *expected);
        *expected += 1;
    }
    assert_eq!(next.len(), 4);
    assert!(next.values().all(|&n| n == 250));

    list.destroy().unwrap();
}

#[test]
fn test_conflicting_writers_never_tear() {
    let store = store();
    let name = unique("overwrite");
    let handle = store
        .open(&name, rememory::ContainerKind::Sequence.default_value())
        .unwrap();

    let children = vec![spawn("overwrite", &name, 1), spawn("overwrite", &name, 2)];
    wait_all(children);

    let final_state = handle.snapshot().unwrap().into_elements().unwrap();
    let first = final_state[0].clone();
    assert!(first == Value::Int(1) || first == Value::Int(2));
    assert!(final_state.iter().all(|v| *v == first));
    assert_eq!(final_state.len(), 299);

    handle.destroy().unwrap();
}
