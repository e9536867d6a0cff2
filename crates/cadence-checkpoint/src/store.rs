//! Directory-tree checkpoint store.
//!
//! Every node is saved to its own directory as `record.json`. A scheduler's
//! children are saved first, each into a subdirectory named
//! `children_<node-id>_<generation>`, and the owner's record lists those
//! names in order under its `children` field.
//!
//! Each push writes the children under a generation no existing
//! subdirectory uses, so the subtree referenced by the current owner record
//! is never modified. Renaming the owner's record into place is the single
//! commit point: before it the old tree is intact, after it the new one
//! is. Directories of the previous generation are pruned afterwards.
//!
//! # Write protocol
//!
//! 1. Encode the record in memory. Encoding errors never touch the disk.
//! 2. Resolve any leftover `record.json.tmp` from an earlier crash.
//! 3. Write and fsync `record.json.tmp`.
//! 4. Rename it over `record.json`.
//!
//! A failure in steps 3 or 4 removes the temp file and leaves the canonical
//! record exactly as it was.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cadence_core::Steppable;
use cadence_types::{Field, FieldValue, NodeId};
use tracing::{debug, info, warn};

use crate::codec::CodecTable;
use crate::error::CheckpointError;
use crate::record::{CheckpointRecord, record_path, temp_path};
use crate::registry::NodeRegistry;

/// Relation name of a scheduler's owned children.
pub const CHILDREN_RELATION: &str = "children";

/// Node field holding the associated checkpoint directory.
const CHECKPOINT_DIR_FIELD: &str = "checkpoint_dir";

/// What [`CheckpointStore::recover`] found in a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No temp file was present.
    Clean,
    /// A complete temp record was promoted to the canonical record.
    Promoted,
    /// An incomplete or foreign temp record was deleted.
    Discarded,
}

/// Saves and restores scheduling trees.
///
/// The store holds the codec table and node registry for the lifetime of
/// the process; both are fixed at construction.
#[derive(Debug, Default)]
pub struct CheckpointStore {
    codecs: CodecTable,
    registry: NodeRegistry,
}

impl CheckpointStore {
    /// Create a store from a codec table and a node registry.
    pub const fn new(codecs: CodecTable, registry: NodeRegistry) -> Self {
        Self { codecs, registry }
    }

    /// Store with no codecs and only the built-in node kinds.
    pub fn with_builtins() -> Self {
        Self::new(CodecTable::new(), NodeRegistry::with_builtins())
    }

    /// The codec table.
    pub const fn codecs(&self) -> &CodecTable {
        &self.codecs
    }

    /// The node registry.
    pub const fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Save `node` and its whole subtree.
    ///
    /// Without `dir`, the previously associated directory is used. Once the
    /// root record is committed, `dir` becomes the node's associated
    /// checkpoint directory, every descendant is associated with its new
    /// subdirectory, and child directories of earlier generations are
    /// deleted.
    ///
    /// If any record fails to write, the previous checkpoint in `dir` is
    /// still the one a restore reads, and no node's association changes.
    /// A failure while pruning comes after the commit.
    ///
    /// Returns the directory the node was written to.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Configuration`] if no directory is given
    /// or associated, [`CheckpointError::Serialization`] if a field cannot be
    /// encoded, and [`CheckpointError::Io`] on filesystem failure.
    pub fn push(
        &self,
        node: &mut dyn Steppable,
        dir: Option<&Path>,
    ) -> Result<PathBuf, CheckpointError> {
        let dir = absolute(&resolve_dir(node, dir, "push")?)?;
        let written = self.write_tree(node, &dir)?;
        let records = written.records();
        let keep = written.names.clone();
        written.associate(node);
        if node.as_scheduler().is_some() {
            prune_stale_children(&dir, &keep)?;
        }

        info!(
            dir = %dir.display(),
            node_id = %node.node().id(),
            kind = node.kind_name(),
            records,
            "Checkpoint written"
        );
        Ok(dir)
    }

    /// Reload `node`'s own fields in place from its record. Children are
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Configuration`] if no directory is given
    /// or associated, and [`CheckpointError::Deserialization`] if the record
    /// is missing, malformed, of another kind, or belongs to another node.
    pub fn pull(&self, node: &mut dyn Steppable, dir: Option<&Path>) -> Result<(), CheckpointError> {
        let dir = resolve_dir(node, dir, "pull")?;
        let record = self.read_record(&dir)?;
        if record.kind != node.kind_name() {
            return Err(CheckpointError::deserialization(
                &dir,
                format!(
                    "record kind `{}` does not match node kind `{}`",
                    record.kind,
                    node.kind_name()
                ),
            ));
        }

        let mut fields = record.to_field_map();
        fields.remove(CHILDREN_RELATION);
        node.load_fields(&fields)
            .map_err(|err| CheckpointError::deserialization(&dir, err.to_string()))?;
        node.node_mut().set_checkpoint_dir(Some(dir.clone()));

        debug!(dir = %dir.display(), node_id = %node.node().id(), "Checkpoint pulled");
        Ok(())
    }

    /// Rebuild a whole subtree from `dir`.
    ///
    /// Children are restored before their owner and handed to the owner's
    /// constructor in their original order. Every restored node is
    /// associated with the directory it was read from.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Deserialization`] if any record in the
    /// subtree is missing or malformed, names an unknown node kind, or uses
    /// an unregistered record kind.
    pub fn restore(&self, dir: &Path) -> Result<Box<dyn Steppable>, CheckpointError> {
        let dir = absolute(dir)?;
        let node = self.restore_tree(&dir)?;
        info!(
            dir = %dir.display(),
            node_id = %node.node().id(),
            kind = node.kind_name(),
            current_step = %node.node().current_step(),
            "Checkpoint restored"
        );
        Ok(node)
    }

    /// Read and decode the canonical record in `dir` without building a
    /// node.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Deserialization`] if the record is absent
    /// or malformed, and [`CheckpointError::Io`] if it cannot be read.
    pub fn read_record(&self, dir: &Path) -> Result<CheckpointRecord, CheckpointError> {
        let path = record_path(dir);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CheckpointError::deserialization(dir, "no record found"));
            }
            Err(err) => return Err(CheckpointError::io(path, err)),
        };
        CheckpointRecord::decode(&bytes, &self.codecs, dir)
    }

    /// Remove `node`'s checkpoint directory (and with it the whole subtree)
    /// and forget the association on every node of the subtree.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Configuration`] if the node has no
    /// associated directory and [`CheckpointError::Io`] if removal fails.
    pub fn delete(&self, node: &mut dyn Steppable) -> Result<(), CheckpointError> {
        let dir = resolve_dir(node, None, "delete")?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(CheckpointError::io(dir, err)),
        }
        forget_dirs(node);
        info!(dir = %dir.display(), node_id = %node.node().id(), "Checkpoint deleted");
        Ok(())
    }

    /// Resolve a leftover temp record in `dir`.
    ///
    /// A temp record is promoted when it decodes completely and has the
    /// same kind as the canonical record (any kind if there is none);
    /// otherwise it is deleted.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the temp file cannot be renamed or
    /// removed.
    pub fn recover(&self, dir: &Path) -> Result<RecoveryOutcome, CheckpointError> {
        self.resolve_temp(dir, None)
    }

    fn write_tree(&self, node: &dyn Steppable, dir: &Path) -> Result<WrittenTree, CheckpointError> {
        fs::create_dir_all(dir).map_err(|err| CheckpointError::io(dir, err))?;

        let mut children = Vec::new();
        let mut names = Vec::new();
        if let Some(scheduler) = node.as_scheduler() {
            let generation = next_child_generation(dir)?;
            for child in scheduler.children() {
                let name = child_dir_name(child.node().id(), generation);
                children.push(self.write_tree(child, &dir.join(&name))?);
                names.push(name);
            }
        }

        let mut fields: Vec<Field> = node
            .record_fields()
            .into_iter()
            .map(|field| {
                if field.name == CHECKPOINT_DIR_FIELD {
                    Field::new(CHECKPOINT_DIR_FIELD, FieldValue::Path(dir.to_path_buf()))
                } else {
                    field
                }
            })
            .collect();
        if node.as_scheduler().is_some() {
            fields.push(Field::new(
                CHILDREN_RELATION,
                FieldValue::List(names.iter().cloned().map(FieldValue::Str).collect()),
            ));
        }

        let record = CheckpointRecord::new(node.kind_name(), fields);
        self.write_record(dir, &record)?;

        debug!(
            dir = %dir.display(),
            node_id = %node.node().id(),
            kind = %record.kind,
            "Record written"
        );
        Ok(WrittenTree {
            dir: dir.to_path_buf(),
            names,
            children,
        })
    }

    fn restore_tree(&self, dir: &Path) -> Result<Box<dyn Steppable>, CheckpointError> {
        let record = self.read_record(dir)?;
        let factory = self.registry.get(&record.kind).ok_or_else(|| {
            CheckpointError::deserialization(dir, format!("unknown node kind `{}`", record.kind))
        })?;

        let mut fields = record.to_field_map();
        let children = match fields.remove(CHILDREN_RELATION) {
            None => Vec::new(),
            Some(FieldValue::List(names)) => names
                .into_iter()
                .map(|name| match name {
                    FieldValue::Str(name) if parse_child_dir_name(&name).is_some() => {
                        self.restore_tree(&dir.join(name))
                    }
                    other => Err(CheckpointError::deserialization(
                        dir,
                        format!("invalid child reference {other:?}"),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(CheckpointError::deserialization(
                    dir,
                    format!("`{CHILDREN_RELATION}` must be a list, found `{}`", other.tag()),
                ));
            }
        };

        let mut node = factory(&fields, children)
            .map_err(|err| CheckpointError::deserialization(dir, err.to_string()))?;
        node.node_mut().set_checkpoint_dir(Some(dir.to_path_buf()));
        debug!(dir = %dir.display(), node_id = %node.node().id(), "Record restored");
        Ok(node)
    }

    /// Atomically replace the canonical record in the existing directory
    /// `dir` with `record`.
    ///
    /// A leftover temp record is resolved first. The new bytes are written
    /// to the temp sibling, synced, then renamed over the canonical record.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Serialization`] if the record cannot be
    /// encoded and [`CheckpointError::Io`] on filesystem failure. The
    /// canonical record is unchanged on error.
    pub fn write_record(&self, dir: &Path, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let bytes = record.encode(&self.codecs)?;
        self.resolve_temp(dir, Some(&record.kind))?;

        let temp = temp_path(dir);
        if let Err(err) = write_synced(&temp, &bytes) {
            remove_quietly(&temp);
            return Err(CheckpointError::io(temp, err));
        }

        let target = record_path(dir);
        if let Err(err) = fs::rename(&temp, &target) {
            remove_quietly(&temp);
            return Err(CheckpointError::io(target, err));
        }
        Ok(())
    }

    fn resolve_temp(
        &self,
        dir: &Path,
        expected_kind: Option<&str>,
    ) -> Result<RecoveryOutcome, CheckpointError> {
        let temp = temp_path(dir);
        match fs::metadata(&temp) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(RecoveryOutcome::Clean),
            Err(err) => return Err(CheckpointError::io(temp, err)),
        }

        let expected_kind = match expected_kind {
            Some(kind) => Some(kind.to_owned()),
            None => self.read_record(dir).ok().map(|record| record.kind),
        };
        let candidate = fs::read(&temp)
            .ok()
            .and_then(|bytes| CheckpointRecord::decode(&bytes, &self.codecs, dir).ok());

        match candidate {
            Some(record) if expected_kind.as_deref().is_none_or(|kind| kind == record.kind) => {
                let target = record_path(dir);
                fs::rename(&temp, &target).map_err(|err| CheckpointError::io(target, err))?;
                warn!(dir = %dir.display(), kind = %record.kind, "Promoted leftover temp record");
                Ok(RecoveryOutcome::Promoted)
            }
            _ => {
                fs::remove_file(&temp).map_err(|err| CheckpointError::io(&temp, err))?;
                warn!(dir = %dir.display(), "Discarded leftover temp record");
                Ok(RecoveryOutcome::Discarded)
            }
        }
    }
}

/// Directories written by one push, mirroring the node tree.
struct WrittenTree {
    dir: PathBuf,
    names: Vec<String>,
    children: Vec<WrittenTree>,
}

impl WrittenTree {
    fn records(&self) -> usize {
        self.children
            .iter()
            .fold(1, |total: usize, child| total.saturating_add(child.records()))
    }

    /// Point every node of the subtree at the directory it was written to.
    /// Children are matched positionally, as they were written.
    fn associate(self, node: &mut dyn Steppable) {
        node.node_mut().set_checkpoint_dir(Some(self.dir));
        if let Some(scheduler) = node.as_scheduler_mut() {
            for (child, written) in scheduler.children_mut().zip(self.children) {
                written.associate(&mut **child);
            }
        }
    }
}

/// Subdirectory name for generation `generation` of the child `id`.
pub fn child_dir_name(id: NodeId, generation: u64) -> String {
    format!("{CHILDREN_RELATION}_{}_{generation}", id.simple())
}

/// Split a child directory name into the child's identity and the
/// generation it was written under. Anything else (including names with
/// path separators) yields `None`.
pub fn parse_child_dir_name(name: &str) -> Option<(NodeId, u64)> {
    let rest = name
        .strip_prefix(CHILDREN_RELATION)
        .and_then(|rest| rest.strip_prefix('_'))?;
    let (id, generation) = rest.split_once('_')?;
    if !id.chars().all(|c| c.is_ascii_hexdigit())
        || generation.is_empty()
        || !generation.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some((NodeId::parse(id).ok()?, generation.parse().ok()?))
}

/// A generation above every child directory currently in `dir`.
///
/// # Errors
///
/// Returns [`CheckpointError::Io`] if `dir` exists but cannot be listed.
pub fn next_child_generation(dir: &Path) -> Result<u64, CheckpointError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(1),
        Err(err) => return Err(CheckpointError::io(dir, err)),
    };
    let mut highest: u64 = 0;
    for entry in entries {
        let entry = entry.map_err(|err| CheckpointError::io(dir, err))?;
        if let Some((_, generation)) = parse_child_dir_name(&entry.file_name().to_string_lossy()) {
            highest = highest.max(generation);
        }
    }
    Ok(highest.saturating_add(1))
}

fn resolve_dir(
    node: &dyn Steppable,
    dir: Option<&Path>,
    operation: &str,
) -> Result<PathBuf, CheckpointError> {
    dir.map(Path::to_path_buf)
        .or_else(|| node.node().checkpoint_dir().map(Path::to_path_buf))
        .ok_or_else(|| CheckpointError::Configuration {
            reason: format!(
                "{operation}: node {} has no checkpoint directory",
                node.node().id()
            ),
        })
}

fn absolute(dir: &Path) -> Result<PathBuf, CheckpointError> {
    std::path::absolute(dir).map_err(|err| CheckpointError::io(dir, err))
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "Failed to remove temp record");
        }
    }
}

/// Delete child directories in `dir` that are not listed in `keep`.
///
/// Call only after the owner record naming `keep` is committed.
///
/// # Errors
///
/// Returns [`CheckpointError::Io`] if a directory cannot be listed or
/// removed.
pub fn prune_stale_children(dir: &Path, keep: &[String]) -> Result<(), CheckpointError> {
    let entries = fs::read_dir(dir).map_err(|err| CheckpointError::io(dir, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| CheckpointError::io(dir, err))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if parse_child_dir_name(&name).is_none() || keep.contains(&name) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).map_err(|err| CheckpointError::io(&path, err))?;
            debug!(dir = %path.display(), "Removed stale child checkpoint");
        }
    }
    Ok(())
}

fn forget_dirs(node: &mut dyn Steppable) {
    node.node_mut().set_checkpoint_dir(None);
    if let Some(scheduler) = node.as_scheduler_mut() {
        for child in scheduler.children_mut() {
            forget_dirs(&mut **child);
        }
    }
}
