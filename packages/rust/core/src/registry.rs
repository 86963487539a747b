//! Plugin registry and the runtime context that owns process-wide state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use assetcat_shared::{Actor, ActorId, ActorKind, CatalogError, ChangesetId, Result};

use crate::schedule::{Pipeline, ScheduledUnit, SourceBinding};
use crate::unit::{ProcessingUnit, SourceUnit};

pub type ProcessorFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn ProcessingUnit>> + Send + Sync>;
pub type SourceFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn SourceUnit>> + Send + Sync>;

fn poison_err<T>(_: PoisonError<T>) -> CatalogError {
    CatalogError::config("runtime state lock poisoned")
}

// ---------------------------------------------------------------------------
// Unit registry
// ---------------------------------------------------------------------------

/// Maps plugin identifiers to unit constructors.
#[derive(Clone, Default)]
pub struct UnitRegistry {
    processors: BTreeMap<String, ProcessorFactory>,
    sources: BTreeMap<String, SourceFactory>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `fs` source and `sha256` processor.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register(&mut registry);
        registry
    }

    pub fn register_processor<F>(&mut self, plugin: &str, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn ProcessingUnit>> + Send + Sync + 'static,
    {
        self.processors.insert(plugin.to_string(), Arc::new(factory));
    }

    pub fn register_source<F>(&mut self, plugin: &str, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn SourceUnit>> + Send + Sync + 'static,
    {
        self.sources.insert(plugin.to_string(), Arc::new(factory));
    }

    pub fn build_processor(
        &self,
        plugin: &str,
        config: &serde_json::Value,
    ) -> Result<Arc<dyn ProcessingUnit>> {
        let factory = self.processors.get(plugin).ok_or_else(|| {
            CatalogError::config(format!("no processing unit registered as `{plugin}`"))
        })?;
        factory(config)
    }

    pub fn build_source(&self, plugin: &str, config: &serde_json::Value) -> Result<Arc<dyn SourceUnit>> {
        let factory = self
            .sources
            .get(plugin)
            .ok_or_else(|| CatalogError::config(format!("no source registered as `{plugin}`")))?;
        factory(config)
    }

    /// Registered plugin identifiers, sources then processors.
    pub fn plugins(&self) -> Vec<String> {
        self.sources.keys().chain(self.processors.keys()).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Attribute registry
// ---------------------------------------------------------------------------

/// Bidirectional attribute key ⇄ numeric id mapping shared with workers.
///
/// Ids are assigned in insertion order starting at 1 and never change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeRegistry {
    keys: Vec<String>,
    ids: HashMap<String, u32>,
}

impl AttributeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from an explicit `(id, key)` listing.
    pub fn from_entries(entries: impl IntoIterator<Item = (u32, String)>) -> Result<Self> {
        let mut sorted: Vec<(u32, String)> = entries.into_iter().collect();
        sorted.sort_by_key(|(id, _)| *id);
        let mut registry = Self::new();
        for (id, key) in sorted {
            if registry.insert(&key) != id {
                return Err(CatalogError::Worker(format!(
                    "attribute ids are not dense: `{key}` has id {id}"
                )));
            }
        }
        Ok(registry)
    }

    /// Return the id of `key`, assigning the next one if new.
    pub fn insert(&mut self, key: &str) -> u32 {
        if let Some(&id) = self.ids.get(key) {
            return id;
        }
        self.keys.push(key.to_string());
        let id = self.keys.len() as u32;
        self.ids.insert(key.to_string(), id);
        id
    }

    pub fn id(&self, key: &str) -> Option<u32> {
        self.ids.get(key).copied()
    }

    pub fn key(&self, id: u32) -> Option<&str> {
        let index = (id as usize).checked_sub(1)?;
        self.keys.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (u32, &str)> {
        self.keys
            .iter()
            .enumerate()
            .map(|(i, k)| (i as u32 + 1, k.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Running changesets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RunningEntry {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Deregisters a running changeset and signals completion when dropped.
#[derive(Debug)]
pub struct RunningGuard {
    id: ChangesetId,
    done: watch::Sender<bool>,
    runtime: Arc<RuntimeContext>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let _ = self.done.send(true);
        if let Ok(mut running) = self.runtime.running.lock() {
            running.remove(&self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime context
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Instance {
    Source(Arc<dyn SourceUnit>),
    Processor(Arc<dyn ProcessingUnit>),
}

/// Process-scoped state: plugin registry, instance cache, attribute
/// registry, and the set of running changesets.
pub struct RuntimeContext {
    registry: UnitRegistry,
    instances: Mutex<HashMap<ActorId, Instance>>,
    attributes: RwLock<Arc<AttributeRegistry>>,
    running: Mutex<HashMap<ChangesetId, RunningEntry>>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("plugins", &self.registry.plugins())
            .finish_non_exhaustive()
    }
}

impl RuntimeContext {
    pub fn new(registry: UnitRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry,
            instances: Mutex::new(HashMap::new()),
            attributes: RwLock::new(Arc::new(AttributeRegistry::new())),
            running: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    /// Resolve every actor to a unit (cached per actor) and stage the result.
    pub fn build_pipeline(&self, actors: &[Actor]) -> Result<Pipeline> {
        let mut sources = Vec::new();
        let mut units = Vec::new();
        for actor in actors {
            match self.resolve(actor)? {
                Instance::Source(unit) => sources.push(SourceBinding {
                    actor: actor.clone(),
                    unit,
                }),
                Instance::Processor(unit) => units.push(ScheduledUnit {
                    actor: actor.clone(),
                    unit,
                }),
            }
        }
        let pipeline = Pipeline::build(sources, units)?;
        self.seed_attributes(pipeline.attribute_keys())?;
        Ok(pipeline)
    }

    fn resolve(&self, actor: &Actor) -> Result<Instance> {
        if let Some(instance) = self.instances.lock().map_err(poison_err)?.get(&actor.id) {
            return Ok(instance.clone());
        }
        let instance = match actor.kind {
            ActorKind::Source => {
                Instance::Source(self.registry.build_source(&actor.plugin, &actor.config)?)
            }
            ActorKind::Processor | ActorKind::Analyzer | ActorKind::Editor => Instance::Processor(
                self.registry.build_processor(&actor.plugin, &actor.config)?,
            ),
        };
        debug!(actor = %actor.name, plugin = %actor.plugin, "resolved unit");
        self.instances
            .lock()
            .map_err(poison_err)?
            .insert(actor.id, instance.clone());
        Ok(instance)
    }

    /// Add keys to the attribute registry. Existing ids are preserved.
    pub fn seed_attributes(&self, keys: BTreeSet<String>) -> Result<Arc<AttributeRegistry>> {
        let mut current = self.attributes.write().map_err(poison_err)?;
        if keys.iter().all(|k| current.id(k).is_some()) {
            return Ok(Arc::clone(&*current));
        }
        let mut next = AttributeRegistry::clone(&**current);
        for key in &keys {
            next.insert(key);
        }
        info!(attributes = next.len(), "seeded attribute registry");
        *current = Arc::new(next);
        Ok(Arc::clone(&*current))
    }

    /// Snapshot of the attribute registry.
    pub fn attributes(&self) -> Result<Arc<AttributeRegistry>> {
        Ok(Arc::clone(&*self.attributes.read().map_err(poison_err)?))
    }

    /// Register a changeset as running; the guard deregisters it on drop.
    pub fn register_running(
        self: &Arc<Self>,
        id: ChangesetId,
    ) -> Result<(CancellationToken, RunningGuard)> {
        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.running.lock().map_err(poison_err)?.insert(
            id,
            RunningEntry {
                token: token.clone(),
                done: done_rx,
            },
        );
        Ok((
            token,
            RunningGuard {
                id,
                done: done_tx,
                runtime: Arc::clone(self),
            },
        ))
    }

    /// Request cooperative cancellation. Returns false if not running.
    pub fn cancel(&self, id: ChangesetId) -> bool {
        let running = match self.running.lock() {
            Ok(running) => running,
            Err(_) => return false,
        };
        match running.get(&id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until `id` is no longer running. Returns false on timeout.
    pub async fn wait_finished(&self, id: ChangesetId, timeout: std::time::Duration) -> bool {
        let done = match self.running.lock() {
            Ok(running) => running.get(&id).map(|e| e.done.clone()),
            Err(_) => None,
        };
        let Some(mut done) = done else {
            return true;
        };
        let wait = async move {
            // Sender dropped also means the run is over.
            let _ = done.wait_for(|finished| *finished).await;
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Ids of changesets currently running.
    pub fn running(&self) -> Vec<ChangesetId> {
        match self.running.lock() {
            Ok(running) => {
                let mut ids: Vec<ChangesetId> = running.keys().copied().collect();
                ids.sort();
                ids
            }
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Capabilities, UnitContext};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Noop(Capabilities);

    impl ProcessingUnit for Noop {
        fn capabilities(&self) -> &Capabilities {
            &self.0
        }
        fn run(&self, _ctx: &mut UnitContext) -> Result<()> {
            Ok(())
        }
    }

    fn actor(id: i64, kind: ActorKind, plugin: &str) -> Actor {
        Actor {
            id: ActorId(id),
            name: format!("{plugin}-{id}"),
            kind,
            plugin: plugin.into(),
            config: serde_json::json!({"root": "/tmp"}),
        }
    }

    #[test]
    fn attribute_ids_are_stable_and_dense() {
        let mut reg = AttributeRegistry::new();
        assert_eq!(reg.insert("path"), 1);
        assert_eq!(reg.insert("sha256"), 2);
        assert_eq!(reg.insert("path"), 1);
        assert_eq!(reg.key(2), Some("sha256"));
        assert_eq!(reg.key(0), None);

        let copy = AttributeRegistry::from_entries(
            reg.entries().map(|(id, k)| (id, k.to_string())),
        )
        .unwrap();
        assert_eq!(copy, reg);
        assert!(AttributeRegistry::from_entries([(2, "x".to_string())]).is_err());
    }

    #[test]
    fn instances_are_built_once_per_actor() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let mut registry = UnitRegistry::with_builtins();
        registry.register_processor("noop", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Noop(Capabilities::new(["path"], ["seen"]))) as Arc<dyn ProcessingUnit>)
        });
        let runtime = RuntimeContext::new(registry);
        let actors = vec![
            actor(1, ActorKind::Source, "fs"),
            actor(2, ActorKind::Processor, "noop"),
        ];
        let pipeline = runtime.build_pipeline(&actors).unwrap();
        runtime.build_pipeline(&actors).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.actor_ids(), vec![ActorId(1), ActorId(2)]);

        let attributes = runtime.attributes().unwrap();
        assert!(attributes.id("seen").is_some());
        assert!(attributes.id("lost").is_some());
    }

    #[test]
    fn unknown_plugin_is_a_config_error() {
        let runtime = RuntimeContext::new(UnitRegistry::new());
        let err = runtime
            .build_pipeline(&[actor(1, ActorKind::Analyzer, "embeddings")])
            .unwrap_err();
        assert_eq!(err.kind(), assetcat_shared::ErrorKind::Config);
    }

    #[test]
    fn reseeding_keeps_existing_ids() {
        let runtime = RuntimeContext::new(UnitRegistry::new());
        let first = runtime
            .seed_attributes(BTreeSet::from(["b".to_string(), "a".to_string()]))
            .unwrap();
        let second = runtime
            .seed_attributes(BTreeSet::from(["c".to_string(), "a".to_string()]))
            .unwrap();
        assert_eq!(first.id("a"), second.id("a"));
        assert_eq!(first.id("b"), second.id("b"));
        assert_eq!(second.id("c"), Some(3));
    }

    #[tokio::test]
    async fn cancel_and_wait_on_running_changeset() {
        let runtime = RuntimeContext::new(UnitRegistry::new());
        let (token, guard) = runtime.register_running(ChangesetId(7)).unwrap();
        assert_eq!(runtime.running(), vec![ChangesetId(7)]);
        assert!(!runtime.wait_finished(ChangesetId(7), Duration::from_millis(20)).await);

        assert!(runtime.cancel(ChangesetId(7)));
        assert!(token.is_cancelled());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(guard);
        });
        assert!(runtime.wait_finished(ChangesetId(7), Duration::from_secs(2)).await);
        assert!(runtime.running().is_empty());
        assert!(!runtime.cancel(ChangesetId(7)));
    }
}
