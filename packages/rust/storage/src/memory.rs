//! In-memory [`FactStore`] for tests and dry runs.
//!
//! Not durable and single-process only. Enforces the same append-only and
//! closed-changeset rules as [`crate::Storage`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use assetcat_shared::{
    Actor, ActorId, ActorSpec, Asset, AssetId, CatalogError, Changeset, ChangesetId,
    ChangesetStatus, Fact, FactId, Result,
};

use crate::{FactStore, referenced_changesets};

#[derive(Debug, Default)]
struct State {
    actors: Vec<Actor>,
    assets: BTreeMap<AssetId, Asset>,
    changesets: BTreeMap<ChangesetId, Changeset>,
    facts: Vec<Fact>,
    next_changeset: i64,
    next_fact: i64,
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    fail_appends: AtomicBool,
}

fn poison_err<T>(_: PoisonError<T>) -> CatalogError {
    CatalogError::Store("lock poisoned".into())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `append_facts` call fail with a store error.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Total persisted fact rows across all assets.
    pub fn fact_count(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.facts.len())
    }
}

#[async_trait]
impl FactStore for MemoryStore {
    async fn load_facts(&self, asset_id: AssetId) -> Result<Vec<Fact>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut facts: Vec<Fact> = state
            .facts
            .iter()
            .filter(|f| f.asset_id == asset_id)
            .cloned()
            .collect();
        facts.sort_by_key(|f| (f.changeset_id, f.id));
        Ok(facts)
    }

    async fn append_facts(&self, facts: &[Fact]) -> Result<Vec<FactId>> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(CatalogError::Store("append rejected".into()));
        }
        let mut state = self.state.write().map_err(poison_err)?;

        for id in referenced_changesets(facts) {
            match state.changesets.get(&id).map(|c| c.status) {
                Some(ChangesetStatus::InProgress) => {}
                Some(status) => {
                    return Err(CatalogError::validation(format!(
                        "changeset {id} is {} and accepts no new facts",
                        status.as_str()
                    )));
                }
                None => {
                    return Err(CatalogError::validation(format!(
                        "changeset {id} does not exist"
                    )));
                }
            }
        }

        let mut ids = Vec::with_capacity(facts.len());
        for fact in facts {
            state.next_fact += 1;
            let id = FactId(state.next_fact);
            state.facts.push(fact.clone().with_id(id));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn next_changeset_id(&self) -> Result<ChangesetId> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.next_changeset += 1;
        Ok(ChangesetId(state.next_changeset))
    }

    async fn list_active_assets(&self, actors: &[ActorId]) -> Result<Vec<AssetId>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut found: BTreeSet<AssetId> = state
            .assets
            .values()
            .filter(|a| actors.contains(&a.created_by))
            .map(|a| a.id)
            .collect();
        found.extend(
            state
                .facts
                .iter()
                .filter(|f| actors.contains(&f.actor_id))
                .map(|f| f.asset_id),
        );
        Ok(found.into_iter().collect())
    }

    async fn register_actor(&self, spec: &ActorSpec) -> Result<Actor> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some(actor) = state.actors.iter_mut().find(|a| a.name == spec.name) {
            actor.kind = spec.kind;
            actor.plugin = spec.plugin.clone();
            actor.config = spec.config.clone();
            return Ok(actor.clone());
        }
        let actor = Actor {
            id: ActorId(state.actors.len() as i64 + 1),
            name: spec.name.clone(),
            kind: spec.kind,
            plugin: spec.plugin.clone(),
            config: spec.config.clone(),
        };
        state.actors.push(actor.clone());
        Ok(actor)
    }

    async fn list_actors(&self) -> Result<Vec<Actor>> {
        Ok(self.state.read().map_err(poison_err)?.actors.clone())
    }

    async fn find_asset(&self, namespace: &str, external_id: &str) -> Result<Option<Asset>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .assets
            .values()
            .find(|a| a.namespace == namespace && a.external_id == external_id)
            .cloned())
    }

    async fn get_asset(&self, id: AssetId) -> Result<Option<Asset>> {
        Ok(self.state.read().map_err(poison_err)?.assets.get(&id).cloned())
    }

    async fn insert_asset(&self, asset: &Asset) -> Result<Asset> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some(existing) = state
            .assets
            .values()
            .find(|a| a.namespace == asset.namespace && a.external_id == asset.external_id)
        {
            return Ok(existing.clone());
        }
        state.assets.insert(asset.id, asset.clone());
        Ok(asset.clone())
    }

    async fn save_changeset(&self, changeset: &Changeset) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.changesets.insert(changeset.id, changeset.clone());
        Ok(())
    }

    async fn get_changeset(&self, id: ChangesetId) -> Result<Option<Changeset>> {
        Ok(self
            .state
            .read()
            .map_err(poison_err)?
            .changesets
            .get(&id)
            .cloned())
    }

    async fn list_changesets(&self, limit: u32) -> Result<Vec<Changeset>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .changesets
            .values()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
