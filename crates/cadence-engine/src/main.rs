//! Engine binary for the Cadence scheduling kernel.
//!
//! Loads configuration, builds or resumes the demo retail tree, and runs it
//! either paced against the wall clock with periodic checkpoints or as a
//! single partitioned round.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `cadence-config.yaml` (or the path given as
//!    the first argument)
//! 2. Initialize structured logging (tracing)
//! 3. Build the checkpoint store with the demo codecs and node kinds
//! 4. Resume the root from the checkpoint directory, or build a fresh tree
//! 5. Run paced, or split / advance / merge when partitions are configured
//! 6. Save a final checkpoint and log the result

mod checkpoint_observer;
mod demo;
mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cadence_checkpoint::{CheckpointStore, RECORD_FILE};
use cadence_core::config::{KernelConfig, parse_step};
use cadence_core::{RealTimePacer, Scheduler};
use cadence_partition::PartitionRunner;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::checkpoint_observer::CheckpointObserver;
use crate::demo::DemoConfig;
use crate::error::EngineError;

const DEFAULT_CONFIG_PATH: &str = "cadence-config.yaml";

/// Application entry point for the engine.
///
/// # Errors
///
/// Returns an error if configuration, checkpointing, or the run fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let (config, config_found) = load_config(&config_path)?;

    // 2. Initialize structured logging.
    init_tracing(&config);
    info!("cadence-engine starting");
    if !config_found {
        info!(path = %config_path.display(), "Config file not found, using defaults");
    }
    info!(
        clock_kind = %config.clock.kind,
        interval = config.clock.interval,
        speed = config.pacer.speed,
        checkpoint_dir = %config.checkpoint.dir,
        partitions = config.partition.partitions,
        "Configuration loaded"
    );
    let demo_config = DemoConfig::load(&config_path)?;

    // 3. Checkpoint store.
    let store = Arc::new(CheckpointStore::new(demo::codecs(), demo::registry()));
    let checkpoint_dir = PathBuf::from(&config.checkpoint.dir);

    // 4. Resume or build.
    let mut root = load_root(&store, &config, &demo_config, &checkpoint_dir)?;

    // 5. Run.
    if config.partition.partitions > 1 {
        run_partitioned(&store, &config, &mut root, &checkpoint_dir).await?;
    } else {
        run_paced(&store, &config, root, &checkpoint_dir).await?;
    }

    info!("cadence-engine shutdown complete");
    Ok(())
}

/// Load the kernel configuration, falling back to defaults when the file
/// does not exist. The flag reports whether the file was found.
fn load_config(path: &Path) -> Result<(KernelConfig, bool), EngineError> {
    if path.exists() {
        Ok((KernelConfig::from_file(path)?, true))
    } else {
        let mut config = KernelConfig::default();
        config.apply_env_overrides();
        Ok((config, false))
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `logging.level`.
fn init_tracing(config: &KernelConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Restore the root from `dir` when resuming and a record exists there;
/// otherwise build a fresh demo tree.
fn load_root(
    store: &CheckpointStore,
    config: &KernelConfig,
    demo_config: &DemoConfig,
    dir: &Path,
) -> Result<Scheduler, EngineError> {
    if config.checkpoint.resume && dir.join(RECORD_FILE).exists() {
        let outcome = store.recover(dir)?;
        info!(dir = %dir.display(), ?outcome, "Resuming from checkpoint");
        return store.restore(dir)?.into_scheduler().map_err(|node| EngineError::RootKind {
            dir: dir.display().to_string(),
            kind: node.kind_name().to_owned(),
        });
    }
    demo::build_tree(&config.clock, demo_config)
}

/// Pace the root against the wall clock, checkpointing on the configured
/// cadence and once more at the end.
async fn run_paced(
    store: &Arc<CheckpointStore>,
    config: &KernelConfig,
    root: Scheduler,
    dir: &Path,
) -> Result<(), EngineError> {
    let ceiling = config
        .pacer
        .ceiling
        .as_deref()
        .map(|text| parse_step(text, root.node().steps().kind()))
        .transpose()?;

    let mut observer =
        CheckpointObserver::new(Arc::clone(store), dir.to_path_buf(), config.checkpoint.every_ticks);
    let mut pacer = RealTimePacer::new(root, config.pacer.speed)?;
    let summary = pacer
        .run(config.pacer.sync, ceiling, &mut observer)
        .await?;
    if let Some(failure) = observer.take_failure() {
        return Err(failure.into());
    }

    let mut root = pacer.into_scheduler();
    store.push(&mut root, Some(dir))?;

    let totals = demo::totals(&root);
    info!(
        end_reason = ?summary.end_reason,
        ticks = summary.ticks,
        final_step = %summary.final_step,
        periodic_saves = observer.saves(),
        stores = totals.stores,
        shoppers = totals.shoppers,
        visits = totals.visits,
        spent_cents = totals.spent_cents,
        "Paced run complete"
    );
    Ok(())
}

/// Save the root, split it across the configured partitions, advance them
/// in parallel, and merge the result back into the checkpoint directory.
async fn run_partitioned(
    store: &Arc<CheckpointStore>,
    config: &KernelConfig,
    root: &mut Scheduler,
    dir: &Path,
) -> Result<(), EngineError> {
    if root.skip_step() {
        warn!("Skip-step root in partitioned mode; merged clock follows the slowest partition");
    }
    store.push(root, Some(dir))?;

    let runner = PartitionRunner::new(Arc::clone(store));
    let parts: Vec<PathBuf> = (0..config.partition.partitions)
        .map(|i| partition_dir(dir, i))
        .collect();
    runner.split(dir, &parts)?;
    let reports = runner.advance(&parts, config.partition.ticks).await?;
    for report in &reports {
        info!(
            partition = report.index,
            ticks = report.ticks,
            current_step = %report.current_step,
            done = report.done,
            "Partition finished"
        );
    }
    runner.merge(&parts, dir)?;

    let merged = store.restore(dir)?.into_scheduler().map_err(|node| EngineError::RootKind {
        dir: dir.display().to_string(),
        kind: node.kind_name().to_owned(),
    })?;
    let totals = demo::totals(&merged);
    info!(
        partitions = reports.len(),
        current_step = %merged.node().current_step(),
        stores = totals.stores,
        shoppers = totals.shoppers,
        visits = totals.visits,
        spent_cents = totals.spent_cents,
        "Partitioned run complete"
    );
    Ok(())
}

/// Sibling directory of `dir` holding partition `index`.
fn partition_dir(dir: &Path, index: usize) -> PathBuf {
    let name = dir
        .file_name()
        .map_or_else(|| "checkpoint".to_owned(), |n| n.to_string_lossy().into_owned());
    dir.with_file_name(format!("{name}.part-{index}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn partition_dirs_are_siblings() {
        assert_eq!(
            partition_dir(Path::new("/data/checkpoints"), 2),
            PathBuf::from("/data/checkpoints.part-2")
        );
    }

    #[test]
    fn resume_restores_saved_root() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(demo::codecs(), demo::registry());
        let mut config = KernelConfig::parse("clock:\n  kind: integer\n  interval: 1\n").unwrap();
        config.checkpoint.dir = tmp.path().display().to_string();
        let demo_config = DemoConfig::default();

        let mut fresh = load_root(&store, &config, &demo_config, tmp.path()).unwrap();
        fresh.step().unwrap();
        store.push(&mut fresh, Some(tmp.path())).unwrap();

        let resumed = load_root(&store, &config, &demo_config, tmp.path()).unwrap();
        assert_eq!(resumed.node().id(), fresh.node().id());
        assert_eq!(resumed.node().steps().step_count(), 1);

        config.checkpoint.resume = false;
        let rebuilt = load_root(&store, &config, &demo_config, tmp.path()).unwrap();
        assert_ne!(rebuilt.node().id(), fresh.node().id());
    }
}
