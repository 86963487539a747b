//! Capability interfaces implemented by sources and processing units.
//!
//! A unit declares an immutable [`Capabilities`] descriptor at construction.
//! Processing units never touch the store; they read the asset's
//! [`CurrentView`] through a [`UnitContext`] and record their writes there.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use assetcat_shared::{
    ActorId, Asset, CatalogError, ChangesetId, Fact, Result, Value,
};

use crate::merge::{CurrentValue, CurrentView};
use crate::schedule::{self, RunDecision};

/// Attribute keys a unit reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub dependencies: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
    /// Prefer a worker process over the in-process blocking pool.
    #[serde(default)]
    pub isolated: bool,
}

impl Capabilities {
    pub fn new<'a>(
        dependencies: impl IntoIterator<Item = &'a str>,
        outputs: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            dependencies: dependencies.into_iter().map(str::to_string).collect(),
            outputs: outputs.into_iter().map(str::to_string).collect(),
            isolated: false,
        }
    }

    /// Mark the unit for process isolation.
    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }
}

/// A processor, analyzer, or editor.
pub trait ProcessingUnit: Send + Sync {
    fn capabilities(&self) -> &Capabilities;

    /// Whether the unit must execute for this asset.
    fn should_run(&self, actor: ActorId, view: &CurrentView) -> RunDecision {
        schedule::should_run(self.capabilities(), actor, view)
    }

    /// Compute outputs for one asset. Runs on a blocking thread.
    fn run(&self, ctx: &mut UnitContext) -> Result<()>;
}

/// One asset reported by a source scan.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredAsset {
    /// Identifier unique within the source's namespace.
    pub external_id: String,
    pub locator: Url,
    /// Attributes observed during discovery. Repeated keys are multi-valued.
    pub attributes: Vec<(String, Value)>,
}

/// A running enumeration.
#[async_trait]
pub trait AssetScan: Send {
    /// Next batch of assets, or `None` once the scan is exhausted.
    async fn next_batch(&mut self) -> Result<Option<Vec<DiscoveredAsset>>>;
}

/// Enumerates assets.
#[async_trait]
pub trait SourceUnit: Send + Sync {
    /// Outputs are the attribute keys attached during discovery.
    fn capabilities(&self) -> &Capabilities;

    async fn scan(&self) -> Result<Box<dyn AssetScan>>;
}

// ---------------------------------------------------------------------------
// Unit context
// ---------------------------------------------------------------------------

/// What a unit sees and writes while running against one asset.
#[derive(Debug, Clone)]
pub struct UnitContext {
    unit: String,
    asset: Asset,
    actor_id: ActorId,
    changeset_id: ChangesetId,
    outputs: BTreeSet<String>,
    view: CurrentView,
    staged: Vec<Fact>,
    skipped: Option<String>,
}

impl UnitContext {
    pub fn new(
        unit: impl Into<String>,
        asset: Asset,
        actor_id: ActorId,
        changeset_id: ChangesetId,
        capabilities: &Capabilities,
        view: CurrentView,
    ) -> Self {
        Self {
            unit: unit.into(),
            asset,
            actor_id,
            changeset_id,
            outputs: capabilities.outputs.clone(),
            view,
            staged: Vec::new(),
            skipped: None,
        }
    }

    pub fn unit_name(&self) -> &str {
        &self.unit
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub fn changeset_id(&self) -> ChangesetId {
        self.changeset_id
    }

    /// The asset's view as of the start of this run.
    pub fn view(&self) -> &CurrentView {
        &self.view
    }

    pub fn get(&self, key: &str) -> &[CurrentValue] {
        self.view.get(key)
    }

    pub fn first(&self, key: &str) -> Option<&Value> {
        self.view.first(key)
    }

    /// Replace this actor's values of `key` with `values`.
    pub fn set(&mut self, key: &str, values: impl IntoIterator<Item = Value>) -> Result<()> {
        self.check_output(key)?;
        let mut wanted: Vec<Value> = Vec::new();
        for value in values {
            if !wanted.contains(&value) {
                wanted.push(value);
            }
        }
        for (value, actor) in self.active(key) {
            if actor == self.actor_id && !wanted.contains(&value) {
                self.push(key, value, true);
            }
        }
        for value in wanted {
            self.push(key, value, false);
        }
        Ok(())
    }

    /// Assert one more value of `key`.
    pub fn add(&mut self, key: &str, value: Value) -> Result<()> {
        self.check_output(key)?;
        self.push(key, value, false);
        Ok(())
    }

    /// Retract one value of `key`.
    pub fn remove(&mut self, key: &str, value: Value) -> Result<()> {
        self.check_output(key)?;
        self.push(key, value, true);
        Ok(())
    }

    /// Retract every active value of `key`, whoever asserted it.
    pub fn clear(&mut self, key: &str) -> Result<()> {
        self.check_output(key)?;
        for (value, _) in self.active(key) {
            self.push(key, value, true);
        }
        Ok(())
    }

    /// Report that the unit does not apply to this asset.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.skipped = Some(reason.into());
    }

    pub fn skipped(&self) -> Option<&str> {
        self.skipped.as_deref()
    }

    pub fn staged(&self) -> &[Fact] {
        &self.staged
    }

    pub fn into_facts(self) -> Vec<Fact> {
        self.staged
    }

    fn check_output(&self, key: &str) -> Result<()> {
        if self.outputs.contains(key) {
            Ok(())
        } else {
            Err(CatalogError::unit(
                &self.unit,
                format!("wrote undeclared attribute `{key}`"),
            ))
        }
    }

    /// Active values of `key` including writes made so far in this run.
    fn active(&self, key: &str) -> Vec<(Value, ActorId)> {
        let mut active: Vec<(Value, ActorId)> = self
            .view
            .get(key)
            .iter()
            .map(|v| (v.value.clone(), v.actor_id))
            .collect();
        for fact in self.staged.iter().filter(|f| f.key == key) {
            active.retain(|(v, _)| *v != fact.value);
            if !fact.removed {
                active.insert(0, (fact.value.clone(), fact.actor_id));
            }
        }
        active
    }

    fn push(&mut self, key: &str, value: Value, removed: bool) {
        let fact = if removed {
            Fact::tombstone(self.asset.id, key, value, self.actor_id, self.changeset_id)
        } else {
            Fact::assert(self.asset.id, key, value, self.actor_id, self.changeset_id)
        };
        self.staged.push(fact);
    }
}
