//! Integration tests for `cadence-checkpoint`.
//!
//! Every test works in its own temporary directory. The fixtures model a
//! small delivery network: a `Depot` scheduler with an inline `Place`
//! record and `Courier` leaves that draw from their random streams on each
//! step, so restored runs can be compared draw for draw.

// Integration tests use expect/unwrap extensively for clarity -- panicking
// on failure is the correct behavior in test code.
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::indexing_slicing
)]

use std::fs;
use std::path::Path;

use cadence_checkpoint::{
    CheckpointError, CheckpointStore, CodecTable, NodeRegistry, RECORD_FILE, RecoveryOutcome,
    TEMP_FILE, child_dir_name, parse_child_dir_name,
};
use cadence_core::{ParentClock, ScheduleError, ScheduleNode, Scheduler, StepOutcome, Steppable};
use cadence_types::{Field, FieldError, FieldMap, FieldValue, IntervalValue, StepValue};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Place {
    name: String,
    lat: f64,
    lon: f64,
}

#[derive(Debug)]
struct Depot {
    scheduler: Scheduler,
    place: Place,
    dispatches: u64,
}

impl Steppable for Depot {
    fn kind_name(&self) -> &'static str {
        "Depot"
    }

    fn node(&self) -> &ScheduleNode {
        self.scheduler.node()
    }

    fn node_mut(&mut self) -> &mut ScheduleNode {
        self.scheduler.node_mut()
    }

    fn step_under(&mut self, parent: Option<&ParentClock>) -> Result<StepOutcome, ScheduleError> {
        let outcome = self.scheduler.step_under(parent)?;
        self.dispatches = self.dispatches.saturating_add(1);
        Ok(outcome)
    }

    fn record_fields(&self) -> Vec<Field> {
        let mut fields = self.scheduler.fields();
        fields.push(Field::new(
            "place",
            FieldValue::record("Place", &self.place).unwrap_or(FieldValue::Null),
        ));
        fields.push(Field::new("dispatches", FieldValue::from_count(self.dispatches)));
        fields
    }

    fn load_fields(&mut self, fields: &FieldMap) -> Result<(), FieldError> {
        let place = fields.record("place", "Place")?;
        let dispatches = fields.count("dispatches")?;
        Steppable::load_fields(&mut self.scheduler, fields)?;
        self.place = place;
        self.dispatches = dispatches;
        Ok(())
    }

    fn as_scheduler(&self) -> Option<&Scheduler> {
        Some(&self.scheduler)
    }

    fn as_scheduler_mut(&mut self) -> Option<&mut Scheduler> {
        Some(&mut self.scheduler)
    }

    fn into_scheduler(self: Box<Self>) -> Result<Scheduler, Box<dyn Steppable>> {
        Err(self)
    }
}

fn build_depot(
    fields: &FieldMap,
    children: Vec<Box<dyn Steppable>>,
) -> Result<Box<dyn Steppable>, FieldError> {
    Ok(Box::new(Depot {
        scheduler: Scheduler::from_fields(fields, children)?,
        place: fields.record("place", "Place")?,
        dispatches: fields.count("dispatches")?,
    }))
}

#[derive(Debug)]
struct Courier {
    node: ScheduleNode,
    distance: i64,
}

impl Steppable for Courier {
    fn kind_name(&self) -> &'static str {
        "Courier"
    }

    fn node(&self) -> &ScheduleNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut ScheduleNode {
        &mut self.node
    }

    fn step_under(&mut self, parent: Option<&ParentClock>) -> Result<StepOutcome, ScheduleError> {
        let outcome = self.node.advance_under(parent)?;
        let leg: i64 = self.node.rng_mut().random_range(1..100);
        self.distance = self.distance.saturating_add(leg);
        Ok(outcome)
    }

    fn record_fields(&self) -> Vec<Field> {
        let mut fields = self.node.fields();
        fields.push(Field::new("distance", FieldValue::Int(self.distance)));
        fields
    }

    fn load_fields(&mut self, fields: &FieldMap) -> Result<(), FieldError> {
        let distance = fields.int("distance")?;
        self.node.load_fields(fields)?;
        self.distance = distance;
        Ok(())
    }

    fn into_scheduler(self: Box<Self>) -> Result<Scheduler, Box<dyn Steppable>> {
        Err(self)
    }
}

fn build_courier(
    fields: &FieldMap,
    _children: Vec<Box<dyn Steppable>>,
) -> Result<Box<dyn Steppable>, FieldError> {
    Ok(Box::new(Courier {
        node: ScheduleNode::from_fields(fields)?,
        distance: fields.int("distance")?,
    }))
}

fn store() -> CheckpointStore {
    CheckpointStore::new(
        CodecTable::new().with_type::<Place>("Place"),
        NodeRegistry::with_builtins()
            .with_kind("Depot", build_depot)
            .with_kind("Courier", build_courier),
    )
}

fn depot(couriers: &[(i64, u64)]) -> Box<dyn Steppable> {
    let mut depot = Depot {
        scheduler: Scheduler::new(
            StepValue::Integer(0),
            IntervalValue::Integer(1),
            Some(StepValue::Integer(100)),
            Some(1),
            false,
        )
        .unwrap(),
        place: Place {
            name: "harbour".to_owned(),
            lat: 51.5,
            lon: -0.125,
        },
        dispatches: 0,
    };
    for (interval, seed) in couriers {
        let courier = Courier {
            node: ScheduleNode::new(
                StepValue::Integer(0),
                IntervalValue::Integer(*interval),
                None,
                Some(*seed),
            )
            .unwrap(),
            distance: 0,
        };
        depot.scheduler.add_child(Box::new(courier)).unwrap();
    }
    Box::new(depot)
}

/// Every record of a subtree, depth first, owner before children.
fn snapshot(node: &dyn Steppable) -> Vec<(String, Vec<Field>)> {
    let mut out = vec![(node.kind_name().to_owned(), node.record_fields())];
    if let Some(scheduler) = node.as_scheduler() {
        for child in scheduler.children() {
            out.extend(snapshot(child));
        }
    }
    out
}

fn run(node: &mut dyn Steppable, ticks: usize) {
    for _ in 0..ticks {
        node.step_under(None).unwrap();
    }
}

#[test]
fn restore_then_continue_matches_uninterrupted_run() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("root");
    let store = store();

    let mut original = depot(&[(2, 11), (3, 12), (5, 13)]);
    run(&mut *original, 7);
    store.push(&mut *original, Some(&dir)).unwrap();

    let mut restored = store.restore(&dir).unwrap();
    assert_eq!(snapshot(&*restored), snapshot(&*original));

    run(&mut *original, 11);
    run(&mut *restored, 11);
    assert_eq!(snapshot(&*restored), snapshot(&*original));
}

#[test]
fn layout_has_one_directory_per_child() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("root");
    let store = store();
    let mut root = depot(&[(2, 1), (3, 2)]);
    store.push(&mut *root, Some(&dir)).unwrap();

    assert!(dir.join(RECORD_FILE).is_file());
    let record = store.read_record(&dir).unwrap();
    assert_eq!(record.kind, "Depot");
    assert_eq!(
        child_entries(&dir),
        root.as_scheduler()
            .unwrap()
            .child_ids()
            .into_iter()
            .map(|id| child_dir_name(id, 1))
            .collect::<Vec<_>>()
    );
    for name in child_entries(&dir) {
        assert!(dir.join(name).join(RECORD_FILE).is_file());
    }
}

/// Child directory names listed by the record in `dir`, in order.
fn child_entries(dir: &Path) -> Vec<String> {
    let record = store().read_record(dir).unwrap();
    let FieldValue::List(children) = record.field("children").unwrap() else {
        panic!("children must be a list");
    };
    children
        .iter()
        .map(|child| match child {
            FieldValue::Str(name) => name.clone(),
            other => panic!("unexpected child reference {other:?}"),
        })
        .collect()
}

/// Child directories actually present in `dir`, sorted.
fn child_dirs_on_disk(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| parse_child_dir_name(name).is_some())
        .collect();
    names.sort();
    names
}

#[test]
fn removed_child_directory_is_pruned_on_next_push() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("root");
    let store = store();
    let mut root = depot(&[(2, 1), (3, 2)]);
    store.push(&mut *root, Some(&dir)).unwrap();

    let scheduler = root.as_scheduler_mut().unwrap();
    let gone = scheduler.child_ids()[0];
    scheduler.remove_child(gone).unwrap();
    store.push(&mut *root, None).unwrap();

    let on_disk = child_dirs_on_disk(&dir);
    assert_eq!(on_disk, child_entries(&dir));
    for name in &on_disk {
        let (id, generation) = parse_child_dir_name(name).unwrap();
        assert_ne!(id, gone);
        assert_eq!(generation, 2);
    }
    let restored = store.restore(&dir).unwrap();
    assert_eq!(restored.as_scheduler().unwrap().len(), 1);
}

#[test]
fn push_associates_nodes_with_their_new_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("root");
    let store = store();
    let mut root = depot(&[(2, 1), (3, 2)]);
    store.push(&mut *root, Some(&dir)).unwrap();
    store.push(&mut *root, None).unwrap();

    assert_eq!(root.node().checkpoint_dir(), Some(dir.as_path()));
    let expected: Vec<_> = child_entries(&dir).into_iter().map(|name| dir.join(name)).collect();
    let actual: Vec<_> = root
        .as_scheduler()
        .unwrap()
        .children()
        .map(|child| child.node().checkpoint_dir().unwrap().to_path_buf())
        .collect();
    assert_eq!(actual, expected);
}

#[test]
fn failed_push_keeps_previous_tree_and_associations() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("root");
    let store = store();
    let mut root = depot(&[(1, 1), (2, 2), (1, 3)]);
    run(&mut *root, 1);
    store.push(&mut *root, Some(&dir)).unwrap();
    let saved = snapshot(&*root);
    let saved_dirs = child_dirs_on_disk(&dir);

    // Children of the new generation get written; the root record does not.
    run(&mut *root, 4);
    fs::create_dir(dir.join(TEMP_FILE)).unwrap();
    assert!(matches!(
        store.push(&mut *root, None),
        Err(CheckpointError::Io { .. })
    ));

    let restored = store.restore(&dir).unwrap();
    assert_eq!(snapshot(&*restored), saved);
    assert_eq!(
        root.as_scheduler()
            .unwrap()
            .children()
            .map(|child| child.node().checkpoint_dir().unwrap().to_path_buf())
            .collect::<Vec<_>>(),
        child_entries(&dir).into_iter().map(|name| dir.join(name)).collect::<Vec<_>>()
    );

    // The next successful push commits the new state and clears both the
    // old generation and the orphaned one.
    fs::remove_dir(dir.join(TEMP_FILE)).unwrap();
    store.push(&mut *root, None).unwrap();
    assert_eq!(snapshot(&*store.restore(&dir).unwrap()), snapshot(&*root));
    let on_disk = child_dirs_on_disk(&dir);
    assert_eq!(on_disk.len(), 3);
    assert!(on_disk.iter().all(|name| !saved_dirs.contains(name)));
}

#[test]
fn failed_push_to_new_directory_keeps_association() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join("home");
    let elsewhere = tmp.path().join("elsewhere");
    let store = store();
    let mut root = depot(&[(2, 1)]);
    store.push(&mut *root, Some(&home)).unwrap();

    fs::create_dir_all(elsewhere.join(TEMP_FILE)).unwrap();
    assert!(store.push(&mut *root, Some(&elsewhere)).is_err());
    assert_eq!(root.node().checkpoint_dir(), Some(home.as_path()));
    for child in root.as_scheduler().unwrap().children() {
        assert!(child.node().checkpoint_dir().unwrap().starts_with(&home));
    }
}

/// Scheduler of built-in nodes on an arbitrary clock.
fn builtin_tree(initial: StepValue, intervals: &[IntervalValue]) -> Scheduler {
    let mut root = Scheduler::new(initial, intervals[0], None, Some(21), false).unwrap();
    for (seed, interval) in (40..).zip(intervals) {
        let child = ScheduleNode::new(initial, *interval, None, Some(seed)).unwrap();
        root.add_child(Box::new(child)).unwrap();
    }
    root
}

#[test]
fn float_clock_tree_restores_exactly() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("root");
    let store = CheckpointStore::with_builtins();
    let mut root = builtin_tree(
        StepValue::Float(0.1),
        &[
            IntervalValue::Float(0.7),
            IntervalValue::Float(0.3),
            IntervalValue::Float(1.1),
        ],
    );
    run(&mut root, 7);
    store.push(&mut root, Some(&dir)).unwrap();

    let mut restored = store.restore(&dir).unwrap();
    assert_eq!(snapshot(&*restored), snapshot(&root));
    run(&mut root, 5);
    run(&mut *restored, 5);
    assert_eq!(snapshot(&*restored), snapshot(&root));
}

#[test]
fn timestamp_clock_tree_restores_exactly() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("root");
    let store = CheckpointStore::with_builtins();
    let start = chrono::DateTime::parse_from_rfc3339("2026-03-01T09:00:00.125Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let mut root = builtin_tree(
        StepValue::Timestamp(start),
        &[
            IntervalValue::Duration(chrono::TimeDelta::seconds(90)),
            IntervalValue::Duration(chrono::TimeDelta::milliseconds(45_250)),
            IntervalValue::Duration(chrono::TimeDelta::minutes(7)),
        ],
    );
    run(&mut root, 9);
    store.push(&mut root, Some(&dir)).unwrap();

    let mut restored = store.restore(&dir).unwrap();
    assert_eq!(snapshot(&*restored), snapshot(&root));
    run(&mut root, 4);
    run(&mut *restored, 4);
    assert_eq!(snapshot(&*restored), snapshot(&root));
}

#[test]
fn pull_reloads_fields_in_place() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("node");
    let store = CheckpointStore::with_builtins();
    let mut node = ScheduleNode::new(
        StepValue::Integer(0),
        IntervalValue::Integer(1),
        None,
        Some(4),
    )
    .unwrap();
    store.push(&mut node, Some(&dir)).unwrap();
    let saved = node.steps().clone();

    node.step().unwrap();
    node.step().unwrap();
    store.pull(&mut node, None).unwrap();
    assert_eq!(node.steps(), &saved);
}

#[test]
fn pull_into_wrong_kind_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("node");
    let store = CheckpointStore::with_builtins();
    let mut leaf = ScheduleNode::new(
        StepValue::Integer(0),
        IntervalValue::Integer(1),
        None,
        Some(4),
    )
    .unwrap();
    store.push(&mut leaf, Some(&dir)).unwrap();

    let mut scheduler =
        Scheduler::new(StepValue::Integer(0), IntervalValue::Integer(1), None, None, false)
            .unwrap();
    let before = scheduler.node().clone();
    assert!(matches!(
        store.pull(&mut scheduler, Some(&dir)),
        Err(CheckpointError::Deserialization { .. })
    ));
    assert_eq!(scheduler.node(), &before);
}

#[test]
fn operations_without_directory_are_configuration_errors() {
    let store = CheckpointStore::with_builtins();
    let mut node = ScheduleNode::new(
        StepValue::Integer(0),
        IntervalValue::Integer(1),
        None,
        None,
    )
    .unwrap();
    assert!(matches!(
        store.push(&mut node, None),
        Err(CheckpointError::Configuration { .. })
    ));
    assert!(matches!(
        store.pull(&mut node, None),
        Err(CheckpointError::Configuration { .. })
    ));
    assert!(matches!(
        store.delete(&mut node),
        Err(CheckpointError::Configuration { .. })
    ));
}

#[test]
fn unregistered_record_kind_fails_both_ways() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("root");
    let without_codec = CheckpointStore::new(
        CodecTable::new(),
        NodeRegistry::with_builtins().with_kind("Depot", build_depot),
    );

    let mut root = depot(&[]);
    assert!(matches!(
        without_codec.push(&mut *root, Some(&dir)),
        Err(CheckpointError::Serialization { .. })
    ));
    assert!(!dir.join(RECORD_FILE).exists());

    store().push(&mut *root, Some(&dir)).unwrap();
    assert!(matches!(
        without_codec.restore(&dir),
        Err(CheckpointError::Deserialization { .. })
    ));
}

#[test]
fn unknown_node_kind_fails_to_restore() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("root");
    let mut root = depot(&[(2, 1)]);
    store().push(&mut *root, Some(&dir)).unwrap();

    let builtins_only = CheckpointStore::new(
        CodecTable::new().with_type::<Place>("Place"),
        NodeRegistry::with_builtins(),
    );
    assert!(matches!(
        builtins_only.restore(&dir),
        Err(CheckpointError::Deserialization { .. })
    ));
}

#[test]
fn missing_record_fails_to_restore() {
    let tmp = tempfile::tempdir().unwrap();
    assert!(matches!(
        store().restore(tmp.path()),
        Err(CheckpointError::Deserialization { .. })
    ));
}

#[test]
fn failed_write_leaves_canonical_record_intact() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("node");
    let store = CheckpointStore::with_builtins();
    let mut node = ScheduleNode::new(
        StepValue::Integer(0),
        IntervalValue::Integer(1),
        None,
        Some(9),
    )
    .unwrap();
    store.push(&mut node, Some(&dir)).unwrap();
    let before = fs::read(dir.join(RECORD_FILE)).unwrap();

    // A directory squatting on the temp path makes the next write fail.
    fs::create_dir(dir.join(TEMP_FILE)).unwrap();
    node.step().unwrap();
    assert!(matches!(
        store.push(&mut node, None),
        Err(CheckpointError::Io { .. })
    ));
    assert_eq!(fs::read(dir.join(RECORD_FILE)).unwrap(), before);
}

fn write_leaf(store: &CheckpointStore, dir: &Path, seed: u64) -> ScheduleNode {
    let mut node = ScheduleNode::new(
        StepValue::Integer(0),
        IntervalValue::Integer(1),
        None,
        Some(seed),
    )
    .unwrap();
    store.push(&mut node, Some(dir)).unwrap();
    node
}

#[test]
fn recover_promotes_complete_temp_record() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("node");
    let store = CheckpointStore::with_builtins();
    let mut node = write_leaf(&store, &dir, 1);

    // Newer state that only made it to the temp file before a crash.
    node.step().unwrap();
    let scratch = tmp.path().join("scratch");
    store.push(&mut node, Some(&scratch)).unwrap();
    fs::copy(scratch.join(RECORD_FILE), dir.join(TEMP_FILE)).unwrap();

    assert_eq!(store.recover(&dir).unwrap(), RecoveryOutcome::Promoted);
    assert!(!dir.join(TEMP_FILE).exists());
    let record = store.read_record(&dir).unwrap();
    assert_eq!(record.to_field_map().count("step_count").unwrap(), 1);
}

#[test]
fn recover_discards_truncated_temp_record() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("node");
    let store = CheckpointStore::with_builtins();
    write_leaf(&store, &dir, 1);
    let before = fs::read(dir.join(RECORD_FILE)).unwrap();

    let truncated = &before[..before.len() / 2];
    fs::write(dir.join(TEMP_FILE), truncated).unwrap();

    assert_eq!(store.recover(&dir).unwrap(), RecoveryOutcome::Discarded);
    assert!(!dir.join(TEMP_FILE).exists());
    assert_eq!(fs::read(dir.join(RECORD_FILE)).unwrap(), before);
    assert_eq!(store.recover(&dir).unwrap(), RecoveryOutcome::Clean);
}

#[test]
fn recover_discards_temp_record_of_other_kind() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("node");
    let store = CheckpointStore::with_builtins();
    write_leaf(&store, &dir, 1);

    let mut other =
        Scheduler::new(StepValue::Integer(0), IntervalValue::Integer(1), None, None, false)
            .unwrap();
    let scratch = tmp.path().join("scratch");
    store.push(&mut other, Some(&scratch)).unwrap();
    fs::copy(scratch.join(RECORD_FILE), dir.join(TEMP_FILE)).unwrap();

    assert_eq!(store.recover(&dir).unwrap(), RecoveryOutcome::Discarded);
    assert_eq!(store.read_record(&dir).unwrap().kind, "ScheduleNode");
}

#[test]
fn delete_removes_tree_and_forgets_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("root");
    let store = store();
    let mut root = depot(&[(2, 1)]);
    store.push(&mut *root, Some(&dir)).unwrap();

    store.delete(&mut *root).unwrap();
    assert!(!dir.exists());
    assert!(root.node().checkpoint_dir().is_none());
    for child in root.as_scheduler().unwrap().children() {
        assert!(child.node().checkpoint_dir().is_none());
    }
}
