//! Split a checkpoint tree into partitions, advance them in parallel, and
//! merge them back.
//!
//! Partitioning works on checkpoint directories, not live trees. The top
//! scheduler's children are dealt round-robin onto N partition directories;
//! each partition carries a full copy of the root record and only its own
//! children. Every partition then runs as an independent tree on its own
//! blocking worker. Merging takes the parent fields from the least advanced
//! partition and unions the children back in their original order.
//!
//! Children only see their parent's clock, so a partitioned run reaches the
//! same child states as the unsplit run as long as the root does not use
//! skip-step. With skip-step the root's grid depends on which children it
//! holds, and the merged clock is the most conservative one.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cadence_checkpoint::{
    CHILDREN_RELATION, CheckpointError, CheckpointRecord, CheckpointStore, TEMP_FILE,
    child_dir_name, next_child_generation, parse_child_dir_name, prune_stale_children,
};
use cadence_types::{Field, FieldValue, NodeId, StepValue};
use tracing::{debug, info};

use crate::error::PartitionError;
use crate::manifest::{MANIFEST_FILE, PartitionManifest};

/// Result of advancing one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionReport {
    /// Partition index from its manifest.
    pub index: usize,
    /// Partition directory.
    pub dir: PathBuf,
    /// Steps actually taken (fewer than requested if the root finished).
    pub ticks: u64,
    /// Root's current step after advancing.
    pub current_step: StepValue,
    /// Whether the root's timeline is exhausted.
    pub done: bool,
}

/// Drives split / advance / merge over checkpoint directories.
#[derive(Debug, Clone)]
pub struct PartitionRunner {
    store: Arc<CheckpointStore>,
}

impl PartitionRunner {
    /// Create a runner sharing `store` with its workers.
    pub const fn new(store: Arc<CheckpointStore>) -> Self {
        Self { store }
    }

    /// The checkpoint store used for every read and write.
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Split the checkpoint tree at `source` onto `targets`.
    ///
    /// Target `i` receives the root record with the children at positions
    /// `i`, `i + N`, `i + 2N`, ... and a `partition.json` manifest. Existing
    /// target directories are replaced, so repeating a split yields
    /// identical partitions.
    ///
    /// # Errors
    ///
    /// Returns [`PartitionError::Invalid`] if there are no targets, a target
    /// coincides with `source`, or the source root is not a scheduler;
    /// checkpoint and I/O errors are propagated.
    pub fn split(
        &self,
        source: &Path,
        targets: &[PathBuf],
    ) -> Result<Vec<PartitionManifest>, PartitionError> {
        if targets.is_empty() {
            return Err(PartitionError::invalid("split needs at least one target"));
        }
        let source = absolute(source)?;
        let targets = targets
            .iter()
            .map(PathBuf::as_path)
            .map(absolute)
            .collect::<Result<Vec<_>, _>>()?;
        if targets.iter().any(|target| *target == source) {
            return Err(PartitionError::invalid(format!(
                "target {} is the split source",
                source.display()
            )));
        }

        self.store.recover(&source)?;
        let record = self.store.read_record(&source)?;
        let children_order = child_names(&record, &source)?;

        let mut manifests = Vec::with_capacity(targets.len());
        for (index, target) in targets.iter().enumerate() {
            let manifest = PartitionManifest {
                index,
                count: targets.len(),
                children_order: children_order.clone(),
            };
            let assigned = manifest.assigned();

            reset_dir(target)?;
            for name in &assigned {
                copy_tree(&source.join(name), &target.join(name))?;
            }
            self.store
                .write_record(target, &with_children(&record, &assigned))?;
            manifest.write(target)?;

            debug!(
                partition = index,
                dir = %target.display(),
                children = assigned.len(),
                "Partition written"
            );
            manifests.push(manifest);
        }

        info!(
            source = %source.display(),
            partitions = targets.len(),
            children = children_order.len(),
            "Checkpoint split"
        );
        Ok(manifests)
    }

    /// Restore each partition, step its root up to `ticks` times, and push
    /// it back. Partitions run concurrently on blocking workers; reports are
    /// returned in the order of `partitions`.
    ///
    /// A root that finishes early stops stepping; that is not an error.
    ///
    /// # Errors
    ///
    /// Returns the first partition error in `partitions` order. Every
    /// worker is awaited before returning, so no partition is left
    /// half-written by an early return.
    pub async fn advance(
        &self,
        partitions: &[PathBuf],
        ticks: u64,
    ) -> Result<Vec<PartitionReport>, PartitionError> {
        let indexed = partitions
            .iter()
            .map(|dir| PartitionManifest::read(dir).map(|manifest| (manifest.index, dir.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let mut handles = Vec::with_capacity(indexed.len());
        for (index, dir) in indexed {
            let store = Arc::clone(&self.store);
            let handle = tokio::task::spawn_blocking(move || advance_one(&store, index, dir, ticks));
            handles.push((index, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (index, handle) in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(source) => Err(PartitionError::Worker { index, source }),
            });
        }
        let reports = results.into_iter().collect::<Result<Vec<_>, _>>()?;

        info!(partitions = reports.len(), ticks, "Partitions advanced");
        Ok(reports)
    }

    /// Merge a complete set of partitions into a single tree at `dest`.
    ///
    /// The partition whose root clock is least advanced supplies the root
    /// fields (ties go to the lowest index). Children are written back in
    /// their original registration order, matched by identity; children a
    /// partition gained while advancing follow, in partition order, and
    /// children it dropped stay dropped.
    ///
    /// `dest` may hold an earlier checkpoint, typically the split source.
    /// The merged children are copied in under a fresh generation and the
    /// merged root record replaces the old one in a single rename, so a
    /// failed merge leaves the earlier checkpoint restorable. The old
    /// generation is removed after that rename.
    ///
    /// # Errors
    ///
    /// Returns [`PartitionError::Manifest`] if the partitions do not form
    /// exactly one complete split, [`PartitionError::Invalid`] if `dest`
    /// is one of the partitions or root clocks cannot be compared, and
    /// propagates checkpoint and I/O errors.
    pub fn merge(&self, partitions: &[PathBuf], dest: &Path) -> Result<PathBuf, PartitionError> {
        let dest = absolute(dest)?;
        let mut loaded = Vec::with_capacity(partitions.len());
        for dir in partitions {
            let dir = absolute(dir)?;
            if dir == dest {
                return Err(PartitionError::invalid(format!(
                    "merge destination {} is one of the partitions",
                    dest.display()
                )));
            }
            let manifest = PartitionManifest::read(&dir)?;
            self.store.recover(&dir)?;
            let record = self.store.read_record(&dir)?;
            let children = child_names(&record, &dir)?;
            let current_step = record
                .to_field_map()
                .step("current_step")
                .map_err(|err| CheckpointError::deserialization(&dir, err.to_string()))?;
            loaded.push(Loaded {
                dir,
                manifest,
                record,
                children,
                current_step,
            });
        }
        check_complete_split(&mut loaded)?;

        let authority = least_advanced(&loaded)?;
        let merged_children = union_children(&loaded);

        fs::create_dir_all(&dest).map_err(|err| PartitionError::io(&dest, err))?;
        let generation = next_child_generation(&dest)?;
        let mut names = Vec::with_capacity(merged_children.len());
        for child in &merged_children {
            let name = child_dir_name(child.id, generation);
            copy_tree(&child.owner.join(&child.name), &dest.join(&name))?;
            names.push(name);
        }
        self.store
            .write_record(&dest, &with_children(&authority.record, &names))?;
        prune_stale_children(&dest, &names)?;
        remove_stale_manifest(&dest)?;

        info!(
            dest = %dest.display(),
            partitions = loaded.len(),
            children = names.len(),
            authority = authority.manifest.index,
            current_step = %authority.current_step,
            "Partitions merged"
        );
        Ok(dest)
    }
}

/// One partition as read by `merge`.
struct Loaded {
    dir: PathBuf,
    manifest: PartitionManifest,
    record: CheckpointRecord,
    children: Vec<String>,
    current_step: StepValue,
}

/// A child chosen for the merged tree and the partition holding it.
struct MergedChild {
    id: NodeId,
    name: String,
    owner: PathBuf,
}

fn advance_one(
    store: &CheckpointStore,
    index: usize,
    dir: PathBuf,
    ticks: u64,
) -> Result<PartitionReport, PartitionError> {
    let mut root = store.restore(&dir)?;
    let mut taken: u64 = 0;
    while taken < ticks && !root.node().is_done() {
        root.step_under(None)?;
        taken = taken.saturating_add(1);
    }
    store.push(&mut *root, Some(&dir))?;

    debug!(
        partition = index,
        dir = %dir.display(),
        ticks = taken,
        current_step = %root.node().current_step(),
        "Partition advanced"
    );
    Ok(PartitionReport {
        index,
        ticks: taken,
        current_step: *root.node().current_step(),
        done: root.node().is_done(),
        dir,
    })
}

/// Sort by index and check that the partitions are exactly one split.
fn check_complete_split(loaded: &mut [Loaded]) -> Result<(), PartitionError> {
    loaded.sort_by_key(|partition| partition.manifest.index);
    let Some(first) = loaded.first() else {
        return Err(PartitionError::invalid("merge needs at least one partition"));
    };
    let count = first.manifest.count;
    let order = first.manifest.children_order.clone();
    if loaded.len() != count {
        return Err(PartitionError::manifest(
            &first.dir,
            format!("split has {count} partitions, {} given", loaded.len()),
        ));
    }
    for (expected, partition) in loaded.iter().enumerate() {
        if partition.manifest.index != expected
            || partition.manifest.count != count
            || partition.manifest.children_order != order
        {
            return Err(PartitionError::manifest(
                &partition.dir,
                "partition does not belong to the same split",
            ));
        }
    }
    Ok(())
}

fn least_advanced(loaded: &[Loaded]) -> Result<&Loaded, PartitionError> {
    let mut best: Option<&Loaded> = None;
    for partition in loaded {
        best = match best {
            None => Some(partition),
            Some(current) => {
                let ordering = partition
                    .current_step
                    .try_cmp(&current.current_step)
                    .map_err(|err| PartitionError::invalid(err.to_string()))?;
                if ordering == Ordering::Less {
                    Some(partition)
                } else {
                    Some(current)
                }
            }
        };
    }
    best.ok_or_else(|| PartitionError::invalid("merge needs at least one partition"))
}

/// Children to write back, each with the partition directory holding it.
///
/// Partitions rename their child directories on every push, so children
/// are matched to the original order by identity.
fn union_children(loaded: &[Loaded]) -> Vec<MergedChild> {
    let mut merged = Vec::new();
    let Some(first) = loaded.first() else {
        return merged;
    };
    let order: Vec<NodeId> = first
        .manifest
        .children_order
        .iter()
        .filter_map(|name| child_id(name))
        .collect();
    let held = |partition: &Loaded, name: &String| {
        child_id(name).map(|id| MergedChild {
            id,
            name: name.clone(),
            owner: partition.dir.clone(),
        })
    };

    for id in &order {
        let found = loaded.iter().find_map(|partition| {
            partition
                .children
                .iter()
                .find(|name| child_id(name) == Some(*id))
                .and_then(|name| held(partition, name))
        });
        merged.extend(found);
    }
    for partition in loaded {
        for name in &partition.children {
            if child_id(name).is_some_and(|id| !order.contains(&id)) {
                merged.extend(held(partition, name));
            }
        }
    }
    merged
}

fn child_id(name: &str) -> Option<NodeId> {
    parse_child_dir_name(name).map(|(id, _)| id)
}

fn child_names(record: &CheckpointRecord, dir: &Path) -> Result<Vec<String>, PartitionError> {
    let not_scheduler = || {
        PartitionError::invalid(format!(
            "root at {} of kind `{}` has no `{CHILDREN_RELATION}`",
            dir.display(),
            record.kind
        ))
    };
    let Some(FieldValue::List(items)) = record.field(CHILDREN_RELATION) else {
        return Err(not_scheduler());
    };
    items
        .iter()
        .map(|item| match item {
            FieldValue::Str(name) if parse_child_dir_name(name).is_some() => Ok(name.clone()),
            other => Err(PartitionError::from(CheckpointError::deserialization(
                dir,
                format!("invalid child reference {other:?}"),
            ))),
        })
        .collect()
}

/// Copy of `record` whose `children` list is `names`.
fn with_children(record: &CheckpointRecord, names: &[String]) -> CheckpointRecord {
    let children = FieldValue::List(names.iter().cloned().map(FieldValue::Str).collect());
    let fields = record
        .fields
        .iter()
        .map(|field| {
            if field.name == CHILDREN_RELATION {
                Field::new(CHILDREN_RELATION, children.clone())
            } else {
                field.clone()
            }
        })
        .collect();
    CheckpointRecord::new(record.kind.clone(), fields)
}

fn absolute(dir: &Path) -> Result<PathBuf, PartitionError> {
    std::path::absolute(dir).map_err(|err| PartitionError::io(dir, err))
}

/// Remove `dir` if present and create it empty.
fn reset_dir(dir: &Path) -> Result<(), PartitionError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(PartitionError::io(dir, err)),
    }
    fs::create_dir_all(dir).map_err(|err| PartitionError::io(dir, err))
}

/// Drop a `partition.json` left in a merge destination that used to be a
/// partition.
fn remove_stale_manifest(dir: &Path) -> Result<(), PartitionError> {
    let path = dir.join(MANIFEST_FILE);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PartitionError::io(path, err)),
    }
}

/// Recursively copy a checkpoint subtree, skipping temp records and
/// manifests.
fn copy_tree(from: &Path, to: &Path) -> Result<(), PartitionError> {
    fs::create_dir_all(to).map_err(|err| PartitionError::io(to, err))?;
    let entries = fs::read_dir(from).map_err(|err| PartitionError::io(from, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| PartitionError::io(from, err))?;
        let name = entry.file_name();
        if name == TEMP_FILE || name == MANIFEST_FILE {
            continue;
        }
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|err| PartitionError::io(&path, err))?;
        if file_type.is_dir() {
            copy_tree(&path, &to.join(&name))?;
        } else {
            fs::copy(&path, to.join(&name)).map_err(|err| PartitionError::io(&path, err))?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn record(children: &[&str]) -> CheckpointRecord {
        CheckpointRecord::new(
            "Scheduler",
            vec![
                Field::new("skip_step", FieldValue::Bool(false)),
                Field::new(
                    CHILDREN_RELATION,
                    FieldValue::List(
                        children
                            .iter()
                            .map(|name| FieldValue::Str((*name).to_owned()))
                            .collect(),
                    ),
                ),
            ],
        )
    }

    #[test]
    fn with_children_replaces_only_the_relation() {
        let a = child_dir_name(NodeId::new(), 1);
        let b = child_dir_name(NodeId::new(), 1);
        let original = record(&[a.as_str(), b.as_str()]);
        let subset = with_children(&original, std::slice::from_ref(&b));
        assert_eq!(subset.kind, "Scheduler");
        assert_eq!(subset.fields.first(), original.fields.first());
        assert_eq!(child_names(&subset, Path::new("x")).unwrap(), vec![b]);
    }

    #[test]
    fn child_references_must_be_directory_names() {
        let bad = record(&["../outside"]);
        assert!(matches!(
            child_names(&bad, Path::new("x")),
            Err(PartitionError::Checkpoint { .. })
        ));
    }

    fn loaded(index: usize, order: &[String], children: &[String]) -> Loaded {
        Loaded {
            dir: PathBuf::from(format!("/parts/{index}")),
            manifest: PartitionManifest {
                index,
                count: 2,
                children_order: order.to_vec(),
            },
            record: record(&[]),
            children: children.to_vec(),
            current_step: StepValue::Integer(0),
        }
    }

    #[test]
    fn union_matches_renamed_children_by_identity() {
        let ids: Vec<NodeId> = (0..4).map(|_| NodeId::new()).collect();
        let order: Vec<String> = ids.iter().take(3).map(|id| child_dir_name(*id, 1)).collect();
        let extra = ids[3];
        let parts = [
            loaded(0, &order, &[child_dir_name(ids[2], 2), child_dir_name(extra, 2)]),
            loaded(1, &order, &[child_dir_name(ids[1], 5)]),
        ];

        let merged = union_children(&parts);
        let got: Vec<(NodeId, String, PathBuf)> = merged
            .into_iter()
            .map(|child| (child.id, child.name, child.owner))
            .collect();
        assert_eq!(
            got,
            vec![
                (ids[1], child_dir_name(ids[1], 5), PathBuf::from("/parts/1")),
                (ids[2], child_dir_name(ids[2], 2), PathBuf::from("/parts/0")),
                (extra, child_dir_name(extra, 2), PathBuf::from("/parts/0")),
            ]
        );
    }

    #[test]
    fn leaf_record_has_no_children() {
        let leaf = CheckpointRecord::new("ScheduleNode", Vec::new());
        assert!(matches!(
            child_names(&leaf, Path::new("x")),
            Err(PartitionError::Invalid { .. })
        ));
    }

    #[test]
    fn copy_tree_skips_temp_and_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let from = tmp.path().join("from");
        let child = child_dir_name(NodeId::new(), 1);
        fs::create_dir_all(from.join(&child)).unwrap();
        fs::write(from.join("record.json"), b"{}").unwrap();
        fs::write(from.join(TEMP_FILE), b"partial").unwrap();
        fs::write(from.join(MANIFEST_FILE), b"{}").unwrap();
        fs::write(from.join(&child).join("record.json"), b"[]").unwrap();

        let to = tmp.path().join("to");
        copy_tree(&from, &to).unwrap();
        assert!(to.join("record.json").is_file());
        assert!(to.join(&child).join("record.json").is_file());
        assert!(!to.join(TEMP_FILE).exists());
        assert!(!to.join(MANIFEST_FILE).exists());
    }
}
