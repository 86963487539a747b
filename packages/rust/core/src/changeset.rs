//! Changeset lifecycle controller.
//!
//! Owns one versioning epoch end to end: scan sources, ingest discovered
//! assets, run staged processing units, persist diffs, mark unseen assets
//! lost, and finalize. Status moves from `InProgress` to exactly one of
//! `Completed`, `Partial`, `Failed` or `Canceled`.
//!
//! Failure policy:
//! - unit errors are recorded per asset and unit; the changeset continues
//! - a source scan error finalizes `Partial`; lost-marking still runs
//! - a store error stops new work and finalizes `Failed`
//! - cancellation is observed between assets and between stages; lost-marking
//!   is skipped and the changeset finalizes `Canceled`

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use assetcat_shared::{
    Actor, Asset, AssetId, CatalogError, Changeset, ChangesetId, ChangesetStats, ChangesetStatus,
    ErrorKind, Fact, KeyCounts, LOST_KEY, RUN_KEY, Result, RunConfig, UnitErrorRecord, Value,
};
use assetcat_storage::FactStore;

use crate::events::{EventSink, ProgressEvent, StageMarker, TerminalEvent, TracingEvents};
use crate::isolate::{Execution, Isolator, Outcome};
use crate::merge::{CurrentView, FactMerge, PersistReport};
use crate::registry::{AttributeRegistry, RunningGuard, RuntimeContext};
use crate::schedule::{Pipeline, RunDecision, RunReason, SourceBinding};
use crate::unit::{DiscoveredAsset, UnitContext};

/// Per-run switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Run every unit regardless of its skip decision.
    pub force: bool,
}

/// A begun changeset, ready to run.
///
/// Finish it with [`ChangesetController::run_changeset`] or
/// [`ChangesetController::abandon_changeset`]. Dropping it otherwise leaves the
/// stored changeset `InProgress`.
pub struct ActiveChangeset {
    pub changeset: Changeset,
    pipeline: Arc<Pipeline>,
    token: CancellationToken,
    guard: Option<RunningGuard>,
}

impl ActiveChangeset {
    pub fn id(&self) -> ChangesetId {
        self.changeset.id
    }

    pub fn status(&self) -> ChangesetStatus {
        self.changeset.status
    }

    /// Token observed by the run; cancel it to stop cooperatively.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl Drop for ActiveChangeset {
    fn drop(&mut self) {
        if !self.changeset.status.is_terminal() {
            warn!(
                changeset_id = %self.changeset.id,
                "changeset dropped before reaching a terminal status"
            );
        }
    }
}

/// What `changeset_status` reports.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub id: ChangesetId,
    pub status: ChangesetStatus,
    pub message: String,
    /// Rows written per attribute key.
    pub counts_by_key: BTreeMap<String, KeyCounts>,
    pub unit_errors: Vec<UnitErrorRecord>,
    pub stats: ChangesetStats,
    /// Whether the changeset is registered as running in this process.
    pub running: bool,
}

/// Drives changesets against a fact store.
pub struct ChangesetController {
    store: Arc<dyn FactStore>,
    runtime: Arc<RuntimeContext>,
    isolator: Arc<Isolator>,
    events: Arc<dyn EventSink>,
    config: RunConfig,
}

impl ChangesetController {
    pub fn new(
        store: Arc<dyn FactStore>,
        runtime: Arc<RuntimeContext>,
        isolator: Arc<Isolator>,
        config: RunConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            isolator,
            events: Arc::new(TracingEvents),
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<dyn FactStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.runtime
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Resolve and stage the actors' units, then open a new changeset.
    ///
    /// Configuration errors (unknown plugin, cycle, unknown key) surface here,
    /// before any changeset id is allocated.
    #[instrument(skip_all, fields(actors = actors.len()))]
    pub async fn begin_changeset(&self, actors: &[Actor], message: &str) -> Result<ActiveChangeset> {
        if !actors.iter().any(|a| a.kind.is_source()) {
            return Err(CatalogError::config("a changeset needs at least one source actor"));
        }
        let pipeline = Arc::new(self.runtime.build_pipeline(actors)?);

        let id = self.store.next_changeset_id().await?;
        let changeset = Changeset {
            id,
            status: ChangesetStatus::InProgress,
            message: message.to_string(),
            actors: pipeline.actor_ids(),
            started_at: Utc::now(),
            finished_at: None,
            stats: ChangesetStats::default(),
        };
        self.store.save_changeset(&changeset).await?;
        let (token, guard) = self.runtime.register_running(id)?;

        info!(
            changeset_id = %id,
            sources = pipeline.sources.len(),
            stages = pipeline.stages.len(),
            "changeset started"
        );
        Ok(ActiveChangeset {
            changeset,
            pipeline,
            token,
            guard: Some(guard),
        })
    }

    /// Run a begun changeset to a terminal status.
    ///
    /// Returns the final statistics, or the store error that failed it.
    #[instrument(skip_all, fields(changeset_id = %active.changeset.id))]
    pub async fn run_changeset(
        &self,
        active: &mut ActiveChangeset,
        options: RunOptions,
    ) -> Result<ChangesetStats> {
        if active.changeset.status.is_terminal() {
            return Err(CatalogError::validation(format!(
                "changeset {} is already {}",
                active.changeset.id,
                active.changeset.status.as_str()
            )));
        }

        let shared = Arc::new(RunShared {
            store: Arc::clone(&self.store),
            isolator: Arc::clone(&self.isolator),
            events: Arc::clone(&self.events),
            pipeline: Arc::clone(&active.pipeline),
            attributes: self.runtime.attributes()?,
            changeset_id: active.changeset.id,
            token: active.token.clone(),
            force: options.force,
            seen: AtomicU64::new(0),
            updated: AtomicU64::new(0),
        });

        let mut run = RunState::default();
        self.scan(&shared, &mut run).await;

        if run.failure.is_none() && !run.canceled && !shared.token.is_cancelled() {
            if let Err(e) = mark_lost(&shared, &run.seen, &mut run.stats).await {
                run.escalate(e);
            }
        }

        let status = run.status(shared.token.is_cancelled());

        self.finalize(active, status, run.stats.clone()).await;
        match run.failure {
            Some(e) => Err(e),
            None => Ok(run.stats),
        }
    }

    /// Enumerate every source and run asset pipelines with bounded concurrency.
    async fn scan(&self, shared: &Arc<RunShared>, run: &mut RunState) {
        let concurrency = self.config.concurrency.max(1);
        let mut tasks: JoinSet<Result<AssetReport>> = JoinSet::new();

        'sources: for (index, source) in shared.pipeline.sources.iter().enumerate() {
            if shared.token.is_cancelled() {
                break;
            }
            let mut scan = match source.unit.scan().await {
                Ok(scan) => scan,
                Err(e) => {
                    run.scan_failed(source, e);
                    continue;
                }
            };
            loop {
                if shared.token.is_cancelled() || run.failure.is_some() {
                    break 'sources;
                }
                let batch = match scan.next_batch().await {
                    Ok(Some(batch)) => batch,
                    Ok(None) => break,
                    Err(e) => {
                        run.scan_failed(source, e);
                        break;
                    }
                };
                for discovered in batch {
                    if shared.token.is_cancelled() || run.failure.is_some() {
                        break 'sources;
                    }
                    while tasks.len() >= concurrency {
                        if let Some(joined) = tasks.join_next().await {
                            run.collect(joined);
                        }
                    }
                    tasks.spawn(process_asset(Arc::clone(shared), index, discovered));
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            run.collect(joined);
        }
    }

    /// Close a begun changeset that will not be run, recording it `Canceled`.
    pub async fn abandon_changeset(&self, mut active: ActiveChangeset) {
        if active.changeset.status.is_terminal() {
            return;
        }
        info!(changeset_id = %active.changeset.id, "changeset abandoned before running");
        self.finalize(&mut active, ChangesetStatus::Canceled, ChangesetStats::default())
            .await;
    }

    async fn finalize(&self, active: &mut ActiveChangeset, status: ChangesetStatus, stats: ChangesetStats) {
        let changeset = &mut active.changeset;
        changeset.status = status;
        changeset.finished_at = Some(Utc::now());
        changeset.stats = stats;
        if let Err(e) = self.store.save_changeset(changeset).await {
            error!(changeset_id = %changeset.id, error = %e, "failed to record terminal status");
        }
        // Deregister and wake anyone waiting on cancellation.
        active.guard.take();

        self.events.finished(&TerminalEvent {
            changeset_id: changeset.id,
            status,
            stats: changeset.stats.clone(),
        });
    }

    /// Request cooperative cancellation. Returns false if not running here.
    pub fn cancel_changeset(&self, id: ChangesetId) -> bool {
        let found = self.runtime.cancel(id);
        if found {
            info!(changeset_id = %id, "cancellation requested");
        }
        found
    }

    /// Cancel and wait up to `timeout` for the run to acknowledge.
    pub async fn cancel_and_wait(&self, id: ChangesetId, timeout: Duration) -> bool {
        self.cancel_changeset(id);
        self.runtime.wait_finished(id, timeout).await
    }

    /// Cancel every running changeset, wait for each, and stop idle workers.
    /// Returns false if any run failed to acknowledge within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let mut clean = true;
        for id in self.runtime.running() {
            if !self.cancel_and_wait(id, timeout).await {
                warn!(changeset_id = %id, "changeset did not acknowledge cancellation");
                clean = false;
            }
        }
        self.isolator.shutdown().await;
        clean
    }

    pub async fn changeset_status(&self, id: ChangesetId) -> Result<StatusReport> {
        let changeset = self
            .store
            .get_changeset(id)
            .await?
            .ok_or_else(|| CatalogError::validation(format!("unknown changeset {id}")))?;
        Ok(StatusReport {
            id,
            status: changeset.status,
            message: changeset.message,
            counts_by_key: changeset.stats.counts_by_key.clone(),
            unit_errors: changeset.stats.unit_errors.clone(),
            running: self.runtime.running().contains(&id),
            stats: changeset.stats,
        })
    }

    /// An asset and its current view.
    pub async fn asset_view(&self, asset_id: AssetId) -> Result<Option<(Asset, CurrentView)>> {
        let Some(asset) = self.store.get_asset(asset_id).await? else {
            return Ok(None);
        };
        let facts = self.store.load_facts(asset_id).await?;
        Ok(Some((asset, CurrentView::from_facts(&facts))))
    }

    /// Full fact history of an asset, oldest first.
    pub async fn asset_history(&self, asset_id: AssetId) -> Result<Vec<Fact>> {
        self.store.load_facts(asset_id).await
    }
}

// ---------------------------------------------------------------------------
// Run internals
// ---------------------------------------------------------------------------

struct RunShared {
    store: Arc<dyn FactStore>,
    isolator: Arc<Isolator>,
    events: Arc<dyn EventSink>,
    pipeline: Arc<Pipeline>,
    attributes: Arc<AttributeRegistry>,
    changeset_id: ChangesetId,
    token: CancellationToken,
    force: bool,
    seen: AtomicU64,
    updated: AtomicU64,
}

impl RunShared {
    fn emit(&self, stage: StageMarker) {
        self.events.progress(&ProgressEvent {
            changeset_id: self.changeset_id,
            assets_seen: self.seen.load(Ordering::Relaxed),
            assets_updated: self.updated.load(Ordering::Relaxed),
            current_stage: stage,
        });
    }
}

#[derive(Default)]
struct RunState {
    seen: HashSet<AssetId>,
    stats: ChangesetStats,
    failure: Option<CatalogError>,
    canceled: bool,
}

impl RunState {
    /// Any enumeration failure of a source is a scan error, whatever its cause.
    fn scan_failed(&mut self, source: &SourceBinding, e: CatalogError) {
        if e.kind() == ErrorKind::Canceled {
            self.canceled = true;
            return;
        }
        warn!(actor = %source.actor.name, error = %e, "source scan failed");
        self.stats
            .scan_errors
            .push(format!("{}: {e}", source.actor.name));
    }

    /// Apply the propagation policy to an error that escaped an asset
    /// pipeline or lost-marking.
    fn escalate(&mut self, e: CatalogError) {
        match e.kind() {
            ErrorKind::Canceled => {
                debug!("work stopped on cancellation");
                self.canceled = true;
            }
            ErrorKind::Scan => {
                warn!(error = %e, "scan error");
                self.stats.scan_errors.push(e.to_string());
            }
            ErrorKind::Unit | ErrorKind::Config | ErrorKind::Store => {
                error!(error = %e, "asset pipeline failed");
                self.failure.get_or_insert(e);
            }
        }
    }

    fn status(&self, cancel_requested: bool) -> ChangesetStatus {
        if self.failure.is_some() {
            ChangesetStatus::Failed
        } else if self.canceled || cancel_requested {
            ChangesetStatus::Canceled
        } else if !self.stats.scan_errors.is_empty() {
            ChangesetStatus::Partial
        } else {
            ChangesetStatus::Completed
        }
    }

    fn collect(
        &mut self,
        joined: std::result::Result<Result<AssetReport>, tokio::task::JoinError>,
    ) {
        match joined {
            Ok(Ok(report)) => {
                self.seen.insert(report.asset_id);
                self.stats.absorb(report.stats);
            }
            Ok(Err(e)) => self.escalate(e),
            Err(join) => {
                self.escalate(CatalogError::Store(format!("asset pipeline aborted: {join}")));
            }
        }
    }
}

struct AssetReport {
    asset_id: AssetId,
    stats: ChangesetStats,
}

fn record_rows(stats: &mut ChangesetStats, report: &PersistReport) {
    for row in &report.rows {
        stats.record_row(row);
    }
}

fn unit_error(actor: &Actor, asset_id: AssetId, message: impl Into<String>) -> UnitErrorRecord {
    UnitErrorRecord {
        actor_id: actor.id,
        unit: actor.name.clone(),
        asset_id,
        message: message.into(),
    }
}

async fn find_or_create(
    shared: &RunShared,
    source: &SourceBinding,
    discovered: &DiscoveredAsset,
) -> Result<(Asset, bool)> {
    let namespace = source.actor.name.as_str();
    if let Some(asset) = shared
        .store
        .find_asset(namespace, &discovered.external_id)
        .await?
    {
        return Ok((asset, false));
    }
    let candidate = Asset {
        id: AssetId::new(),
        namespace: namespace.to_string(),
        external_id: discovered.external_id.clone(),
        locator: discovered.locator.clone(),
        created_by: source.actor.id,
        created_in: shared.changeset_id,
    };
    let stored = shared.store.insert_asset(&candidate).await?;
    let added = stored.id == candidate.id;
    Ok((stored, added))
}

/// One asset's pipeline: ingest source facts, then every stage in order.
async fn process_asset(
    shared: Arc<RunShared>,
    source_index: usize,
    discovered: DiscoveredAsset,
) -> Result<AssetReport> {
    if shared.token.is_cancelled() {
        return Err(CatalogError::Canceled);
    }
    let source = &shared.pipeline.sources[source_index];
    let cs = shared.changeset_id;
    let store = shared.store.as_ref();

    let mut stats = ChangesetStats {
        assets_seen: 1,
        ..Default::default()
    };
    let (asset, added) = find_or_create(&shared, source, &discovered).await?;
    if added {
        stats.assets_added = 1;
    }
    shared.seen.fetch_add(1, Ordering::Relaxed);

    // Ingest: the source's observations replace its previous ones.
    let mut merge = FactMerge::load(store, asset.id).await?;
    let view = merge.current();
    let mut ctx = UnitContext::new(
        source.actor.name.clone(),
        asset.clone(),
        source.actor.id,
        cs,
        source.unit.capabilities(),
        view.clone(),
    );
    let mut grouped: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for (key, value) in &discovered.attributes {
        grouped.entry(key.as_str()).or_default().push(value.clone());
    }
    for (key, values) in grouped {
        if let Err(e) = ctx.set(key, values) {
            stats.unit_errors.push(unit_error(&source.actor, asset.id, e.to_string()));
        }
    }
    merge.stage(ctx.into_facts());
    // Re-discovery clears the lost marker.
    merge.stage(view.get(LOST_KEY).iter().map(|lost| {
        Fact::tombstone(asset.id, LOST_KEY, lost.value.clone(), source.actor.id, cs)
    }));
    let report = merge.persist(store).await?;
    record_rows(&mut stats, &report);

    let mut updated = false;
    if !report.changed_keys.is_empty() && !added {
        updated = true;
        shared.updated.fetch_add(1, Ordering::Relaxed);
    }
    shared.emit(StageMarker::Ingest);

    for (index, stage) in shared.pipeline.stages.iter().enumerate() {
        if shared.token.is_cancelled() {
            debug!(asset_id = %asset.id, stage = index, "canceled between stages");
            break;
        }
        shared.emit(StageMarker::Processing(index));

        for scheduled in stage {
            let view = merge.current();
            let decision = if shared.force {
                RunDecision::Run(RunReason::Forced)
            } else {
                scheduled.unit.should_run(scheduled.actor.id, &view)
            };
            let RunDecision::Run(reason) = decision else {
                stats.units_skipped += 1;
                continue;
            };
            debug!(actor = %scheduled.actor.name, asset_id = %asset.id, ?reason, "running unit");

            let exec = Execution {
                actor: scheduled.actor.clone(),
                unit: Arc::clone(&scheduled.unit),
                asset: asset.clone(),
                changeset_id: cs,
                view,
            };
            match shared.isolator.execute(exec, &shared.attributes).await {
                Outcome::Completed(facts) => {
                    stats.units_run += 1;
                    merge.stage(facts);
                    let report = merge.persist(store).await?;
                    record_rows(&mut stats, &report);
                    if !report.changed_keys.is_empty() && !added && !updated {
                        updated = true;
                        shared.updated.fetch_add(1, Ordering::Relaxed);
                    }
                    let no_op = report.changed_keys.is_empty();
                    if no_op && matches!(reason, RunReason::InputChanged(_)) {
                        let marker = run_marker(&merge.current(), &scheduled.actor, asset.id, cs);
                        merge.stage(marker);
                        let report = merge.persist(store).await?;
                        record_rows(&mut stats, &report);
                    }
                }
                Outcome::Skipped(reason) => {
                    stats.units_skipped += 1;
                    debug!(actor = %scheduled.actor.name, asset_id = %asset.id, %reason, "unit skipped");
                }
                Outcome::Error(message) => {
                    stats.units_run += 1;
                    warn!(actor = %scheduled.actor.name, asset_id = %asset.id, %message, "unit failed");
                    stats
                        .unit_errors
                        .push(unit_error(&scheduled.actor, asset.id, message));
                }
            }
        }
    }

    if updated {
        stats.assets_updated = 1;
    }
    Ok(AssetReport {
        asset_id: asset.id,
        stats,
    })
}

/// Replace `actor`'s run marker on an asset with one for this changeset.
fn run_marker(view: &CurrentView, actor: &Actor, asset_id: AssetId, cs: ChangesetId) -> Vec<Fact> {
    let mut facts: Vec<Fact> = view
        .get(RUN_KEY)
        .iter()
        .filter(|v| v.actor_id == actor.id)
        .map(|v| Fact::tombstone(asset_id, RUN_KEY, v.value.clone(), actor.id, cs))
        .collect();
    let marker = serde_json::json!({"actor": actor.id.0, "changeset": cs.0});
    facts.push(Fact::assert(asset_id, RUN_KEY, Value::Json(marker), actor.id, cs));
    facts
}

/// Mark assets known to this run's sources but not seen by its scan.
async fn mark_lost(
    shared: &RunShared,
    seen: &HashSet<AssetId>,
    stats: &mut ChangesetStats,
) -> Result<()> {
    let sources = shared.pipeline.source_actors();
    let Some(&fallback) = sources.first() else {
        return Ok(());
    };
    shared.emit(StageMarker::LostMarking);
    let store = shared.store.as_ref();
    let cs = shared.changeset_id;

    for asset_id in store.list_active_assets(&sources).await? {
        if shared.token.is_cancelled() {
            return Err(CatalogError::Canceled);
        }
        if seen.contains(&asset_id) {
            continue;
        }
        let mut merge = FactMerge::load(store, asset_id).await?;
        if merge.current().is_lost() {
            continue;
        }
        let marker = match store.get_asset(asset_id).await? {
            Some(asset) if sources.contains(&asset.created_by) => asset.created_by,
            _ => fallback,
        };
        merge.stage([Fact::assert(asset_id, LOST_KEY, Value::Integer(cs.0), marker, cs)]);
        let report = merge.persist(store).await?;
        record_rows(stats, &report);
        stats.assets_lost += 1;
        debug!(%asset_id, "asset marked lost");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use assetcat_shared::{ActorId, ActorKind, ActorSpec, ErrorKind};
    use assetcat_storage::MemoryStore;

    use crate::events::SilentEvents;
    use crate::registry::UnitRegistry;
    use crate::unit::{AssetScan, Capabilities, ProcessingUnit, SourceUnit};

    // -- test units ----------------------------------------------------------

    /// Source yielding `(external_id, name)` pairs one per batch, optionally
    /// failing after a number of assets.
    struct ListSource {
        caps: Capabilities,
        items: Mutex<Vec<(String, String)>>,
        fail_after: Mutex<Option<usize>>,
    }

    impl ListSource {
        fn set(&self, items: &[(&str, &str)], fail_after: Option<usize>) {
            *self.items.lock().unwrap() = items
                .iter()
                .map(|(id, name)| (id.to_string(), name.to_string()))
                .collect();
            *self.fail_after.lock().unwrap() = fail_after;
        }
    }

    struct ListScan {
        items: std::vec::IntoIter<(String, String)>,
        yielded: usize,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl AssetScan for ListScan {
        async fn next_batch(&mut self) -> Result<Option<Vec<DiscoveredAsset>>> {
            if self.fail_after == Some(self.yielded) {
                return Err(CatalogError::Scan("device went away".into()));
            }
            let Some((id, name)) = self.items.next() else {
                return Ok(None);
            };
            self.yielded += 1;
            Ok(Some(vec![DiscoveredAsset {
                locator: format!("mem:///{id}").parse().unwrap(),
                external_id: id,
                attributes: vec![("name".into(), Value::from(name))],
            }]))
        }
    }

    #[async_trait]
    impl SourceUnit for ListSource {
        fn capabilities(&self) -> &Capabilities {
            &self.caps
        }

        async fn scan(&self) -> Result<Box<dyn AssetScan>> {
            Ok(Box::new(ListScan {
                items: self.items.lock().unwrap().clone().into_iter(),
                yielded: 0,
                fail_after: *self.fail_after.lock().unwrap(),
            }))
        }
    }

    /// Writes the length of `name`; fails on the name "corrupt".
    struct NameLength {
        caps: Capabilities,
        runs: Arc<AtomicUsize>,
    }

    impl ProcessingUnit for NameLength {
        fn capabilities(&self) -> &Capabilities {
            &self.caps
        }

        fn run(&self, ctx: &mut UnitContext) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let name = match ctx.first("name") {
                Some(Value::String(name)) => name.clone(),
                _ => return Err(CatalogError::unit("length", "name missing")),
            };
            if name == "corrupt" {
                return Err(CatalogError::unit("length", "cannot measure corrupt name"));
            }
            ctx.set("name_len", [Value::Integer(name.len() as i64)])
        }
    }

    /// Writes `tripped`, and cancels the run it belongs to on the name "stop".
    struct Tripwire {
        caps: Capabilities,
        token: Arc<Mutex<Option<CancellationToken>>>,
    }

    impl ProcessingUnit for Tripwire {
        fn capabilities(&self) -> &Capabilities {
            &self.caps
        }

        fn run(&self, ctx: &mut UnitContext) -> Result<()> {
            if ctx.first("name") == Some(&Value::from("stop")) {
                if let Some(token) = self.token.lock().unwrap().as_ref() {
                    token.cancel();
                }
            }
            ctx.set("tripped", [Value::Integer(1)])
        }
    }

    /// Copies `tripped` into `echoed`, one stage after the tripwire.
    struct Echo(Capabilities);

    impl ProcessingUnit for Echo {
        fn capabilities(&self) -> &Capabilities {
            &self.0
        }

        fn run(&self, ctx: &mut UnitContext) -> Result<()> {
            let value = ctx.first("tripped").cloned().unwrap_or(Value::Integer(0));
            ctx.set("echoed", [value])
        }
    }

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<ProgressEvent>>,
        finished: Mutex<Vec<TerminalEvent>>,
    }

    impl EventSink for Recorder {
        fn progress(&self, event: &ProgressEvent) {
            self.progress.lock().unwrap().push(event.clone());
        }
        fn finished(&self, event: &TerminalEvent) {
            self.finished.lock().unwrap().push(event.clone());
        }
    }

    // -- harness -------------------------------------------------------------

    struct Harness {
        store: Arc<MemoryStore>,
        controller: ChangesetController,
        source: Arc<ListSource>,
        runs: Arc<AtomicUsize>,
        actors: Vec<Actor>,
        events: Arc<Recorder>,
        trip: Arc<Mutex<Option<CancellationToken>>>,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_config(RunConfig::default()).await
        }

        async fn with_config(config: RunConfig) -> Self {
            let source = Arc::new(ListSource {
                caps: Capabilities::new([], ["name"]),
                items: Mutex::new(Vec::new()),
                fail_after: Mutex::new(None),
            });
            let runs = Arc::new(AtomicUsize::new(0));

            let mut registry = UnitRegistry::new();
            let src = Arc::clone(&source);
            registry.register_source("list", move |_| Ok(Arc::clone(&src) as Arc<dyn SourceUnit>));
            let counter = Arc::clone(&runs);
            registry.register_processor("length", move |_| {
                Ok(Arc::new(NameLength {
                    caps: Capabilities::new(["name"], ["name_len"]),
                    runs: Arc::clone(&counter),
                }) as Arc<dyn ProcessingUnit>)
            });
            registry.register_processor("cyclic-a", |_| {
                Ok(Arc::new(NameLength {
                    caps: Capabilities::new(["b"], ["a"]),
                    runs: Arc::new(AtomicUsize::new(0)),
                }) as Arc<dyn ProcessingUnit>)
            });
            registry.register_processor("cyclic-b", |_| {
                Ok(Arc::new(NameLength {
                    caps: Capabilities::new(["a"], ["b"]),
                    runs: Arc::new(AtomicUsize::new(0)),
                }) as Arc<dyn ProcessingUnit>)
            });
            let trip = Arc::new(Mutex::new(None));
            let slot = Arc::clone(&trip);
            registry.register_processor("tripwire", move |_| {
                Ok(Arc::new(Tripwire {
                    caps: Capabilities::new(["name"], ["tripped"]),
                    token: Arc::clone(&slot),
                }) as Arc<dyn ProcessingUnit>)
            });
            registry.register_processor("echo", |_| {
                Ok(Arc::new(Echo(Capabilities::new(["tripped"], ["echoed"])))
                    as Arc<dyn ProcessingUnit>)
            });

            let store = Arc::new(MemoryStore::new());
            let mut actors = Vec::new();
            for (name, kind, plugin) in [
                ("files", ActorKind::Source, "list"),
                ("length", ActorKind::Processor, "length"),
            ] {
                actors.push(register(&store, name, kind, plugin, serde_json::Value::Null).await);
            }

            let events = Arc::new(Recorder::default());
            let dyn_store: Arc<dyn FactStore> = store.clone();
            let controller = ChangesetController::new(
                dyn_store,
                RuntimeContext::new(registry),
                Arc::new(Isolator::in_process(Duration::from_secs(5))),
                config,
            )
            .with_events(events.clone());

            Self {
                store,
                controller,
                source,
                runs,
                actors,
                events,
                trip,
            }
        }

        async fn run(&self, items: &[(&str, &str)]) -> (ActiveChangeset, Result<ChangesetStats>) {
            self.source.set(items, None);
            self.run_prepared(RunOptions::default()).await
        }

        async fn run_prepared(&self, options: RunOptions) -> (ActiveChangeset, Result<ChangesetStats>) {
            let mut active = self
                .controller
                .begin_changeset(&self.actors, "test")
                .await
                .unwrap();
            let result = self.controller.run_changeset(&mut active, options).await;
            (active, result)
        }

        async fn asset(&self, external_id: &str) -> (AssetId, CurrentView) {
            let asset = self
                .store
                .find_asset("files", external_id)
                .await
                .unwrap()
                .expect("asset exists");
            let (_, view) = self.controller.asset_view(asset.id).await.unwrap().unwrap();
            (asset.id, view)
        }
    }

    async fn register(
        store: &MemoryStore,
        name: &str,
        kind: ActorKind,
        plugin: &str,
        config: serde_json::Value,
    ) -> Actor {
        store
            .register_actor(&ActorSpec {
                name: name.into(),
                kind,
                plugin: plugin.into(),
                config,
            })
            .await
            .unwrap()
    }

    // -- scenarios -----------------------------------------------------------

    #[tokio::test]
    async fn first_scan_ingests_and_processes() {
        let h = Harness::new().await;
        let (active, stats) = h.run(&[("a", "alpha"), ("b", "be")]).await;
        let stats = stats.unwrap();

        assert_eq!(active.status(), ChangesetStatus::Completed);
        assert_eq!(stats.assets_seen, 2);
        assert_eq!(stats.assets_added, 2);
        assert_eq!(stats.units_run, 2);
        assert_eq!(h.runs.load(Ordering::SeqCst), 2);

        let (_, view) = h.asset("a").await;
        assert_eq!(view.first("name"), Some(&Value::from("alpha")));
        assert_eq!(view.first("name_len"), Some(&Value::Integer(5)));
        assert_eq!(stats.counts_by_key["name_len"], KeyCounts { inserted: 2, removed: 0 });
    }

    #[tokio::test]
    async fn unchanged_rescan_writes_nothing_and_skips_units() {
        let h = Harness::new().await;
        h.run(&[("a", "alpha"), ("b", "be")]).await.1.unwrap();
        let (_, stats) = h.run(&[("a", "alpha"), ("b", "be")]).await;
        let stats = stats.unwrap();

        assert_eq!(h.runs.load(Ordering::SeqCst), 2);
        assert_eq!(stats.units_skipped, 2);
        assert_eq!(stats.rows_inserted + stats.rows_removed, 0);
        assert_eq!(stats.assets_added, 0);
        assert_eq!(stats.assets_updated, 0);
    }

    #[tokio::test]
    async fn changed_input_reruns_only_affected_asset() {
        let h = Harness::new().await;
        h.run(&[("a", "alpha"), ("b", "be")]).await.1.unwrap();
        let (_, stats) = h.run(&[("a", "alpha"), ("b", "bee")]).await;
        let stats = stats.unwrap();

        assert_eq!(h.runs.load(Ordering::SeqCst), 3);
        assert_eq!(stats.assets_updated, 1);
        let (_, view) = h.asset("b").await;
        assert_eq!(view.get("name").len(), 1);
        assert_eq!(view.first("name_len"), Some(&Value::Integer(3)));
    }

    #[tokio::test]
    async fn forced_run_executes_every_unit() {
        let h = Harness::new().await;
        h.run(&[("a", "alpha")]).await.1.unwrap();
        h.source.set(&[("a", "alpha")], None);
        let (_, stats) = h.run_prepared(RunOptions { force: true }).await;
        assert_eq!(stats.unwrap().units_run, 1);
        assert_eq!(h.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn asset_missing_from_scan_is_marked_lost() {
        let h = Harness::new().await;
        h.run(&[("a", "alpha")]).await.1.unwrap();
        let (second, stats) = h.run(&[]).await;
        assert_eq!(stats.unwrap().assets_lost, 1);

        let (asset_id, view) = h.asset("a").await;
        assert!(view.is_lost());
        assert_eq!(view.first(LOST_KEY), Some(&Value::Integer(second.id().0)));
        assert_eq!(view.first("name"), Some(&Value::from("alpha")));
        assert_eq!(view.first("name_len"), Some(&Value::Integer(5)));
        assert_eq!(h.controller.asset_history(asset_id).await.unwrap().len(), 3);

        // Already lost: not marked again.
        let (_, stats) = h.run(&[]).await;
        assert_eq!(stats.unwrap().assets_lost, 0);

        // Resurfacing clears the marker.
        h.run(&[("a", "alpha")]).await.1.unwrap();
        let (_, view) = h.asset("a").await;
        assert!(!view.is_lost());
    }

    #[tokio::test]
    async fn scan_failure_finalizes_partial_and_still_marks_lost() {
        let h = Harness::new().await;
        let all = [("a", "a"), ("b", "b"), ("c", "c"), ("d", "d"), ("e", "e")];
        h.run(&all).await.1.unwrap();

        h.source.set(&all, Some(2));
        let (active, stats) = h.run_prepared(RunOptions::default()).await;
        let stats = stats.unwrap();

        assert_eq!(active.status(), ChangesetStatus::Partial);
        assert_eq!(stats.scan_errors.len(), 1);
        assert_eq!(stats.assets_seen, 2);
        assert_eq!(stats.assets_lost, 3);
        for id in ["a", "b"] {
            assert!(!h.asset(id).await.1.is_lost());
        }
        for id in ["c", "d", "e"] {
            assert!(h.asset(id).await.1.is_lost());
        }
        let report = h.controller.changeset_status(active.id()).await.unwrap();
        assert_eq!(report.status, ChangesetStatus::Partial);
        assert!(!report.running);
    }

    #[tokio::test]
    async fn unit_errors_are_recorded_not_fatal() {
        let h = Harness::new().await;
        let (active, stats) = h.run(&[("a", "alpha"), ("x", "corrupt")]).await;
        let stats = stats.unwrap();

        assert_eq!(active.status(), ChangesetStatus::Completed);
        assert_eq!(stats.unit_errors.len(), 1);
        assert_eq!(stats.unit_errors[0].unit, "length");
        assert!(stats.unit_errors[0].message.contains("corrupt"));
        assert_eq!(h.asset("a").await.1.first("name_len"), Some(&Value::Integer(5)));

        let report = h.controller.changeset_status(active.id()).await.unwrap();
        assert_eq!(report.unit_errors.len(), 1);
    }

    #[tokio::test]
    async fn cyclic_units_fail_before_any_execution() {
        let h = Harness::new().await;
        let mut actors = vec![h.actors[0].clone()];
        for (id, plugin) in [(10, "cyclic-a"), (11, "cyclic-b")] {
            actors.push(Actor {
                id: ActorId(id),
                name: plugin.into(),
                kind: ActorKind::Analyzer,
                plugin: plugin.into(),
                config: serde_json::Value::Null,
            });
        }
        let err = h
            .controller
            .begin_changeset(&actors, "cycle")
            .await
            .err()
            .expect("cycle rejected");
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(h.store.list_changesets(10).await.unwrap().is_empty());
        assert_eq!(h.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_preserves_history_and_skips_lost_marking() {
        let h = Harness::new().await;
        h.run(&[("a", "alpha")]).await.1.unwrap();

        h.source.set(&[("b", "be")], None);
        let mut active = h.controller.begin_changeset(&h.actors, "cancel").await.unwrap();
        assert!(h.controller.cancel_changeset(active.id()));
        let stats = h
            .controller
            .run_changeset(&mut active, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(active.status(), ChangesetStatus::Canceled);
        assert_eq!(stats.assets_seen, 0);
        assert!(!h.asset("a").await.1.is_lost());
        assert!(h.store.find_asset("files", "b").await.unwrap().is_none());
        assert!(!h.controller.cancel_changeset(active.id()));
        assert!(
            h.controller
                .cancel_and_wait(active.id(), Duration::from_millis(50))
                .await
        );
    }

    #[tokio::test]
    async fn cancellation_mid_run_keeps_finished_work() {
        let mut h = Harness::with_config(RunConfig {
            concurrency: 1,
            ..RunConfig::default()
        })
        .await;
        h.run(&[("z", "zed")]).await.1.unwrap();

        for name in ["tripwire", "echo"] {
            let actor = register(&h.store, name, ActorKind::Analyzer, name, serde_json::Value::Null)
                .await;
            h.actors.push(actor);
        }
        h.source.set(
            &[("a", "alpha"), ("b", "stop"), ("c", "gamma"), ("d", "delta")],
            None,
        );
        let mut active = h.controller.begin_changeset(&h.actors, "interrupted").await.unwrap();
        *h.trip.lock().unwrap() = Some(active.cancel_token());
        let stats = h
            .controller
            .run_changeset(&mut active, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(active.status(), ChangesetStatus::Canceled);
        assert_eq!(stats.assets_seen, 2);
        assert_eq!(stats.assets_lost, 0);

        // Finished before the cancel: every stage persisted.
        let (_, a) = h.asset("a").await;
        assert_eq!(a.first("name_len"), Some(&Value::Integer(5)));
        assert_eq!(a.first("echoed"), Some(&Value::Integer(1)));

        // Canceled from inside stage 0: that stage persisted, stage 1 never ran.
        let (_, b) = h.asset("b").await;
        assert_eq!(b.first("tripped"), Some(&Value::Integer(1)));
        assert!(!b.contains_key("echoed"));

        for id in ["c", "d"] {
            assert!(h.store.find_asset("files", id).await.unwrap().is_none());
        }
        assert!(!h.asset("z").await.1.is_lost());

        // All pipelines drained before the run returned.
        assert!(h.controller.runtime().running().is_empty());
        let report = h.controller.changeset_status(active.id()).await.unwrap();
        assert_eq!(report.status, ChangesetStatus::Canceled);
        assert!(!report.running);
        let finished = h.events.finished.lock().unwrap().clone();
        assert_eq!(finished.last().map(|e| e.status), Some(ChangesetStatus::Canceled));
    }

    #[tokio::test]
    async fn abandoned_changeset_is_closed_as_canceled() {
        let h = Harness::new().await;
        let active = h.controller.begin_changeset(&h.actors, "never run").await.unwrap();
        let id = active.id();
        h.controller.abandon_changeset(active).await;

        let stored = h.store.get_changeset(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChangesetStatus::Canceled);
        assert!(stored.finished_at.is_some());
        assert!(h.controller.runtime().running().is_empty());
        let finished = h.events.finished.lock().unwrap().clone();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, ChangesetStatus::Canceled);
    }

    #[tokio::test]
    async fn rerun_without_output_change_is_not_repeated() {
        let h = Harness::new().await;
        h.run(&[("a", "ab")]).await.1.unwrap();

        // Same length: the unit re-runs but writes no output row.
        let (second, stats) = h.run(&[("a", "cd")]).await;
        assert_eq!(stats.unwrap().units_run, 1);
        assert_eq!(h.runs.load(Ordering::SeqCst), 2);
        let (_, view) = h.asset("a").await;
        assert_eq!(view.first("name_len"), Some(&Value::Integer(2)));
        assert_eq!(view.last_written_by(RUN_KEY, h.actors[1].id), Some(second.id()));

        let (_, stats) = h.run(&[("a", "cd")]).await;
        let stats = stats.unwrap();
        assert_eq!(stats.units_skipped, 1);
        assert_eq!(stats.rows_inserted + stats.rows_removed, 0);
        assert_eq!(h.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rewritten_file_is_rehashed() {
        let root = std::env::temp_dir().join(format!("assetcat-rehash-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&root).unwrap();
        let file = root.join("doc.txt");

        let store = Arc::new(MemoryStore::new());
        let fs_config = serde_json::json!({"root": root.to_str().unwrap()});
        let actors = vec![
            register(&store, "disk", ActorKind::Source, "fs", fs_config).await,
            register(&store, "hash", ActorKind::Processor, "sha256", serde_json::Value::Null).await,
        ];
        let dyn_store: Arc<dyn FactStore> = store.clone();
        let controller = ChangesetController::new(
            dyn_store,
            RuntimeContext::new(UnitRegistry::with_builtins()),
            Arc::new(Isolator::in_process(Duration::from_secs(5))),
            RunConfig::default(),
        )
        .with_events(Arc::new(SilentEvents));

        let mut hashes = Vec::new();
        for body in ["abc", "a much longer different body"] {
            std::fs::write(&file, body).unwrap();
            let mut active = controller.begin_changeset(&actors, "hash").await.unwrap();
            let stats = controller
                .run_changeset(&mut active, RunOptions::default())
                .await
                .unwrap();
            assert_eq!(stats.units_run, 1);

            let asset = store.find_asset("disk", "doc.txt").await.unwrap().unwrap();
            let (_, view) = controller.asset_view(asset.id).await.unwrap().unwrap();
            assert_eq!(view.get("sha256").len(), 1);
            hashes.push(view.first("sha256").cloned().unwrap());
        }
        assert_eq!(
            hashes[0],
            Value::from("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_ne!(hashes[0], hashes[1]);
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn store_failure_finalizes_failed() {
        let h = Harness::new().await;
        h.source.set(&[("a", "alpha")], None);
        let mut active = h.controller.begin_changeset(&h.actors, "broken").await.unwrap();
        h.store.fail_appends(true);

        let err = h
            .controller
            .run_changeset(&mut active, RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
        assert_eq!(active.status(), ChangesetStatus::Failed);
        let stored = h.store.get_changeset(active.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, ChangesetStatus::Failed);
    }

    #[tokio::test]
    async fn terminal_changeset_is_closed() {
        let h = Harness::new().await;
        let (mut active, stats) = h.run(&[("a", "alpha")]).await;
        stats.unwrap();
        let (asset_id, _) = h.asset("a").await;

        let late = Fact::assert(asset_id, "name", Value::from("late"), h.actors[0].id, active.id());
        assert!(h.store.append_facts(&[late]).await.is_err());
        assert!(
            h.controller
                .run_changeset(&mut active, RunOptions::default())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn events_report_progress_and_one_terminal_status() {
        let h = Harness::new().await;
        let (active, _) = h.run(&[("a", "alpha")]).await;

        let progress = h.events.progress.lock().unwrap().clone();
        assert!(progress.iter().any(|e| e.current_stage == StageMarker::Ingest));
        assert!(progress.iter().any(|e| e.current_stage == StageMarker::Processing(0)));
        assert!(progress.iter().all(|e| e.changeset_id == active.id()));

        let finished = h.events.finished.lock().unwrap().clone();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, ChangesetStatus::Completed);
    }

    #[tokio::test]
    async fn shutdown_with_nothing_running_is_clean() {
        let h = Harness::new().await;
        assert!(h.controller.shutdown(Duration::from_millis(50)).await);
    }
}
