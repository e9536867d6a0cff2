//! Demo retail domain driven by the engine.
//!
//! The tree is a root scheduler holding one [`StoreNode`] per store. Each
//! store is itself a scheduler over its [`Shopper`] leaves. Shoppers visit
//! on their own cadence and spend a random amount drawn from their private
//! stream; stores count the ticks they were open. Nothing here models
//! retail realistically: the demo exists to exercise custom node kinds,
//! nested schedulers, and inline domain records in checkpoints.

use std::path::Path;

use cadence_checkpoint::{CodecTable, NodeRegistry};
use cadence_core::config::ClockConfig;
use cadence_core::{ParentClock, ScheduleError, ScheduleNode, Scheduler, StepOutcome, Steppable};
use cadence_types::{Field, FieldError, FieldMap, FieldValue, IntervalValue, StepKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::EngineError;

/// Kind name of [`StoreNode`] records.
pub const STORE_KIND: &str = "Store";

/// Kind name of [`Shopper`] records.
pub const SHOPPER_KIND: &str = "Shopper";

/// Record kind of the inline [`Place`] payload.
pub const PLACE_KIND: &str = "Place";

/// Demo tree shape, read from the `demo` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DemoConfig {
    /// Store names; one store node is created per entry.
    #[serde(default = "default_stores")]
    pub stores: Vec<String>,

    /// Shoppers attached to each store.
    #[serde(default = "default_shoppers_per_store")]
    pub shoppers_per_store: usize,

    /// Longest shopper visit cadence, in root intervals.
    #[serde(default = "default_max_visit_every")]
    pub max_visit_every: u32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            stores: default_stores(),
            shoppers_per_store: default_shoppers_per_store(),
            max_visit_every: default_max_visit_every(),
        }
    }
}

fn default_stores() -> Vec<String> {
    vec!["harbour".to_owned(), "market".to_owned()]
}

const fn default_shoppers_per_store() -> usize {
    4
}

const fn default_max_visit_every() -> u32 {
    6
}

impl DemoConfig {
    /// Read the `demo` section of the YAML file at `path`.
    ///
    /// A missing file or a file without a `demo` key yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Demo`] if the file cannot be read or the
    /// section does not parse.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| EngineError::Demo {
            message: format!("failed to read config file: {e}"),
        })?;
        Self::parse(&contents)
    }

    /// Read the `demo` section from a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Demo`] if the document or the section does
    /// not parse.
    pub fn parse(yaml: &str) -> Result<Self, EngineError> {
        let raw: serde_yml::Value = serde_yml::from_str(yaml).map_err(|e| EngineError::Demo {
            message: format!("failed to parse config YAML: {e}"),
        })?;
        match raw.get("demo") {
            Some(section) => serde_yml::from_value(section.clone()).map_err(|e| EngineError::Demo {
                message: format!("failed to parse demo config: {e}"),
            }),
            None => Ok(Self::default()),
        }
    }
}

/// Where a store is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    /// Display name.
    pub name: String,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
}

/// A store: a scheduler over its shoppers with an inline location record.
#[derive(Debug)]
pub struct StoreNode {
    scheduler: Scheduler,
    place: Place,
    open_ticks: u64,
}

impl Steppable for StoreNode {
    fn kind_name(&self) -> &'static str {
        STORE_KIND
    }

    fn node(&self) -> &ScheduleNode {
        self.scheduler.node()
    }

    fn node_mut(&mut self) -> &mut ScheduleNode {
        self.scheduler.node_mut()
    }

    fn step_under(&mut self, parent: Option<&ParentClock>) -> Result<StepOutcome, ScheduleError> {
        let outcome = self.scheduler.step_under(parent)?;
        self.open_ticks = self.open_ticks.saturating_add(1);
        debug!(
            store = %self.place.name,
            step = %outcome.current_step,
            open_ticks = self.open_ticks,
            "Store ticked"
        );
        Ok(outcome)
    }

    fn record_fields(&self) -> Vec<Field> {
        let mut fields = self.scheduler.fields();
        fields.push(Field::new(
            "place",
            FieldValue::record(PLACE_KIND, &self.place).unwrap_or(FieldValue::Null),
        ));
        fields.push(Field::new("open_ticks", FieldValue::from_count(self.open_ticks)));
        fields
    }

    fn load_fields(&mut self, fields: &FieldMap) -> Result<(), FieldError> {
        let place = fields.record(PLACE_KIND, PLACE_KIND)?;
        let open_ticks = fields.count("open_ticks")?;
        Steppable::load_fields(&mut self.scheduler, fields)?;
        self.place = place;
        self.open_ticks = open_ticks;
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

/// A shopper visiting a store on a fixed cadence.
#[derive(Debug)]
pub struct Shopper {
    node: ScheduleNode,
    visits: u64,
    spent_cents: u64,
}

impl Steppable for Shopper {
    fn kind_name(&self) -> &'static str {
        SHOPPER_KIND
    }

    fn node(&self) -> &ScheduleNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut ScheduleNode {
        &mut self.node
    }

    fn step_under(&mut self, parent: Option<&ParentClock>) -> Result<StepOutcome, ScheduleError> {
        let outcome = self.node.advance_under(parent)?;
        let basket: u64 = self.node.rng_mut().random_range(100..5_000);
        self.visits = self.visits.saturating_add(1);
        self.spent_cents = self.spent_cents.saturating_add(basket);
        Ok(outcome)
    }

    fn record_fields(&self) -> Vec<Field> {
        let mut fields = self.node.fields();
        fields.push(Field::new("visits", FieldValue::from_count(self.visits)));
        fields.push(Field::new("spent_cents", FieldValue::from_count(self.spent_cents)));
        fields
    }

    fn load_fields(&mut self, fields: &FieldMap) -> Result<(), FieldError> {
        let visits = fields.count("visits")?;
        let spent_cents = fields.count("spent_cents")?;
        self.node.load_fields(fields)?;
        self.visits = visits;
        self.spent_cents = spent_cents;
        Ok(())
    }

    fn into_scheduler(self: Box<Self>) -> Result<Scheduler, Box<dyn Steppable>> {
        Err(self)
    }
}

/// Totals over a demo tree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DemoTotals {
    /// Store nodes found.
    pub stores: usize,
    /// Shopper nodes found.
    pub shoppers: usize,
    /// Visits summed over all shoppers.
    pub visits: u64,
    /// Spend summed over all shoppers, in cents.
    pub spent_cents: u64,
}

/// Sum shopper activity across `root`, reading each node's persisted
/// fields so that restored and live trees are summarized the same way.
pub fn totals(root: &Scheduler) -> DemoTotals {
    let mut totals = DemoTotals::default();
    for store in root.children() {
        let Some(store) = store.as_scheduler().filter(|_| store.kind_name() == STORE_KIND) else {
            continue;
        };
        totals.stores = totals.stores.saturating_add(1);
        for shopper in store.children() {
            if shopper.kind_name() != SHOPPER_KIND {
                continue;
            }
            let fields: FieldMap = shopper.record_fields().into_iter().collect();
            totals.shoppers = totals.shoppers.saturating_add(1);
            totals.visits = totals
                .visits
                .saturating_add(fields.count("visits").unwrap_or(0));
            totals.spent_cents = totals
                .spent_cents
                .saturating_add(fields.count("spent_cents").unwrap_or(0));
        }
    }
    totals
}

/// Codecs for the demo's inline records.
pub fn codecs() -> CodecTable {
    CodecTable::new().with_type::<Place>(PLACE_KIND)
}

/// Registry with the built-in kinds plus the demo kinds.
pub fn registry() -> NodeRegistry {
    NodeRegistry::with_builtins()
        .with_kind(STORE_KIND, build_store)
        .with_kind(SHOPPER_KIND, build_shopper)
}

fn build_store(
    fields: &FieldMap,
    children: Vec<Box<dyn Steppable>>,
) -> Result<Box<dyn Steppable>, FieldError> {
    Ok(Box::new(StoreNode {
        scheduler: Scheduler::from_fields(fields, children)?,
        place: fields.record(PLACE_KIND, PLACE_KIND)?,
        open_ticks: fields.count("open_ticks")?,
    }))
}

fn build_shopper(
    fields: &FieldMap,
    _children: Vec<Box<dyn Steppable>>,
) -> Result<Box<dyn Steppable>, FieldError> {
    Ok(Box::new(Shopper {
        node: ScheduleNode::from_fields(fields)?,
        visits: fields.count("visits")?,
        spent_cents: fields.count("spent_cents")?,
    }))
}

/// Build a fresh demo tree under a root scheduler configured by `clock`.
///
/// Child seeds and visit cadences are drawn from the root's stream, so the
/// same root seed always yields the same tree shape.
///
/// # Errors
///
/// Returns [`EngineError::Config`] for an invalid clock section,
/// [`EngineError::Demo`] for an invalid demo section, and
/// [`EngineError::Schedule`] if a node cannot be created.
pub fn build_tree(clock: &ClockConfig, demo: &DemoConfig) -> Result<Scheduler, EngineError> {
    if demo.max_visit_every == 0 {
        return Err(EngineError::Demo {
            message: "demo.max_visit_every must be at least 1".to_owned(),
        });
    }
    let kind = clock.step_kind()?;
    let initial = clock.initial_step()?;
    let interval = clock.interval_value()?;
    let max_step = clock.max_step()?;

    let mut root = Scheduler::new(initial, interval, max_step, clock.seed, clock.skip_step)?;
    for (position, name) in demo.stores.iter().enumerate() {
        let store_seed = root.node_mut().rng_mut().random_range(0..u64::MAX);
        let mut store = StoreNode {
            scheduler: Scheduler::new(initial, interval, None, Some(store_seed), clock.skip_step)?,
            place: Place {
                name: name.clone(),
                lat: grid_coordinate(position, 0.25),
                lon: grid_coordinate(position, -0.5),
            },
            open_ticks: 0,
        };
        for _ in 0..demo.shoppers_per_store {
            let every = store
                .scheduler
                .node_mut()
                .rng_mut()
                .random_range(1..=demo.max_visit_every);
            let seed = store.scheduler.node_mut().rng_mut().random_range(0..u64::MAX);
            let shopper = Shopper {
                node: ScheduleNode::new(
                    initial,
                    scale_interval(&interval, every, kind)?,
                    None,
                    Some(seed),
                )?,
                visits: 0,
                spent_cents: 0,
            };
            store
                .scheduler
                .add_child(Box::new(shopper))
                .map_err(ScheduleError::from)?;
        }
        root.add_child(Box::new(store)).map_err(ScheduleError::from)?;
    }

    info!(
        stores = demo.stores.len(),
        shoppers_per_store = demo.shoppers_per_store,
        root_id = %root.node().id(),
        "Demo tree built"
    );
    Ok(root)
}

/// `interval` repeated `times`, in the clock's kind.
fn scale_interval(
    interval: &IntervalValue,
    times: u32,
    kind: StepKind,
) -> Result<IntervalValue, EngineError> {
    IntervalValue::Float(interval.as_seconds() * f64::from(times))
        .cast(kind)
        .map_err(|e| EngineError::Demo {
            message: format!("shopper cadence: {e}"),
        })
}

#[allow(clippy::cast_precision_loss)]
fn grid_coordinate(position: usize, step: f64) -> f64 {
    position as f64 * step
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cadence_checkpoint::CheckpointStore;

    use super::*;

    fn integer_clock() -> ClockConfig {
        ClockConfig {
            kind: "integer".to_owned(),
            interval: 1.0,
            max: Some("50".to_owned()),
            ..ClockConfig::default()
        }
    }

    #[test]
    fn demo_section_defaults_when_absent() {
        let demo = DemoConfig::parse("clock:\n  kind: integer\n").unwrap();
        assert_eq!(demo, DemoConfig::default());
    }

    #[test]
    fn demo_section_overrides() {
        let demo = DemoConfig::parse("demo:\n  stores: [a]\n  shoppers_per_store: 2\n").unwrap();
        assert_eq!(demo.stores, vec!["a"]);
        assert_eq!(demo.shoppers_per_store, 2);
        assert_eq!(demo.max_visit_every, 6);
    }

    #[test]
    fn same_seed_builds_same_tree() {
        let a = build_tree(&integer_clock(), &DemoConfig::default()).unwrap();
        let b = build_tree(&integer_clock(), &DemoConfig::default()).unwrap();
        assert_eq!(a.len(), 2);
        for (x, y) in a.children().zip(b.children()) {
            let (x, y) = (x.as_scheduler().unwrap(), y.as_scheduler().unwrap());
            assert_eq!(x.len(), 4);
            for (p, q) in x.children().zip(y.children()) {
                assert_eq!(p.node().steps().interval(), q.node().steps().interval());
                assert_eq!(p.node().rng_stream(), q.node().rng_stream());
            }
        }
    }

    #[test]
    fn demo_tree_survives_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(codecs(), registry());
        let mut root = build_tree(&integer_clock(), &DemoConfig::default()).unwrap();
        for _ in 0..12 {
            root.step().unwrap();
        }
        store.push(&mut root, Some(tmp.path())).unwrap();

        let restored = store.restore(tmp.path()).unwrap();
        assert_eq!(restored.record_fields(), root.record_fields());
        let restored = restored.into_scheduler().unwrap();
        for (x, y) in restored.children().zip(root.children()) {
            assert_eq!(x.kind_name(), STORE_KIND);
            assert_eq!(x.record_fields(), y.record_fields());
        }
    }

    #[test]
    fn totals_count_every_visit() {
        let mut root = build_tree(&integer_clock(), &DemoConfig::default()).unwrap();
        assert_eq!(
            totals(&root),
            DemoTotals {
                stores: 2,
                shoppers: 8,
                visits: 0,
                spent_cents: 0,
            }
        );
        for _ in 0..30 {
            root.step().unwrap();
        }
        let after = totals(&root);
        // Every shopper visits at least every six ticks.
        assert!(after.visits >= 8 * 5);
        assert!(after.spent_cents >= after.visits * 100);
    }

    #[test]
    fn zero_cadence_is_rejected() {
        let demo = DemoConfig {
            max_visit_every: 0,
            ..DemoConfig::default()
        };
        assert!(matches!(
            build_tree(&integer_clock(), &demo),
            Err(EngineError::Demo { .. })
        ));
    }
}
