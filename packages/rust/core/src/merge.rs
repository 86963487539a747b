//! Fact merge engine.
//!
//! Resolves an asset's append-only fact history (plus facts staged by the
//! actor currently running) into the multi-valued [`CurrentView`], and
//! computes the minimal set of rows needed to persist a staged change.
//!
//! Resolution rule: facts are grouped by `(key, value)`. Within a group the
//! fact with the highest `(changeset_id, row)` wins; a winning tombstone
//! suppresses that value only. Surviving values of a key are ordered by
//! their winner, most recent first. Staged facts order after every persisted
//! row of the same changeset, and among themselves by staging order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use assetcat_shared::{ActorId, AssetId, ChangesetId, Fact, FactId, LOST_KEY, Result, Value};
use assetcat_storage::FactStore;

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Row {
    Persisted(FactId),
    Staged(usize),
}

type Position = (ChangesetId, Row);

struct Winner<'a> {
    pos: Position,
    fact: &'a Fact,
}

/// Winning fact per `(key, value)` group.
type Groups<'a> = BTreeMap<&'a str, HashMap<&'a Value, Winner<'a>>>;

fn resolve<'a>(facts: impl Iterator<Item = (Position, &'a Fact)>) -> Groups<'a> {
    let mut groups: Groups<'a> = BTreeMap::new();
    for (pos, fact) in facts {
        let slot = groups.entry(fact.key.as_str()).or_default();
        match slot.get(&fact.value) {
            Some(existing) if existing.pos > pos => {}
            _ => {
                slot.insert(&fact.value, Winner { pos, fact });
            }
        }
    }
    groups
}

// ---------------------------------------------------------------------------
// Current view
// ---------------------------------------------------------------------------

/// One active value of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentValue {
    pub value: Value,
    /// Actor of the most recent assertion of this value.
    pub actor_id: ActorId,
    /// Changeset of the most recent assertion of this value.
    pub changeset_id: ChangesetId,
}

/// When a key last changed, overall and per writing actor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyHistory {
    /// Most recent changeset holding any row for the key, tombstones included.
    pub last_changed: ChangesetId,
    /// Most recent changeset in which each actor wrote the key.
    pub by_actor: BTreeMap<ActorId, ChangesetId>,
}

/// Derived multi-valued state of one asset. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentView {
    entries: BTreeMap<String, Vec<CurrentValue>>,
    history: BTreeMap<String, KeyHistory>,
}

impl CurrentView {
    fn build<'a>(facts: impl Iterator<Item = (Position, &'a Fact)> + Clone) -> Self {
        let mut history: BTreeMap<String, KeyHistory> = BTreeMap::new();
        for (_, fact) in facts.clone() {
            let entry = history.entry(fact.key.clone()).or_default();
            entry.last_changed = entry.last_changed.max(fact.changeset_id);
            let by_actor = entry.by_actor.entry(fact.actor_id).or_insert(fact.changeset_id);
            *by_actor = (*by_actor).max(fact.changeset_id);
        }

        let mut entries = BTreeMap::new();
        for (key, group) in resolve(facts) {
            let mut active: Vec<&Winner<'_>> =
                group.values().filter(|w| !w.fact.removed).collect();
            if active.is_empty() {
                continue;
            }
            active.sort_by(|a, b| b.pos.cmp(&a.pos));
            entries.insert(
                key.to_string(),
                active
                    .into_iter()
                    .map(|w| CurrentValue {
                        value: w.fact.value.clone(),
                        actor_id: w.fact.actor_id,
                        changeset_id: w.fact.changeset_id,
                    })
                    .collect(),
            );
        }

        Self { entries, history }
    }

    /// Resolve a complete, persisted history.
    pub fn from_facts(facts: &[Fact]) -> Self {
        Self::build(persisted(facts))
    }

    /// Active values of `key`, most recent first. Empty if absent.
    pub fn get(&self, key: &str) -> &[CurrentValue] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Most recent active value of `key`.
    pub fn first(&self, key: &str) -> Option<&Value> {
        self.get(key).first().map(|v| &v.value)
    }

    /// Whether `key` has at least one active value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> &BTreeMap<String, Vec<CurrentValue>> {
        &self.entries
    }

    pub fn history(&self) -> &BTreeMap<String, KeyHistory> {
        &self.history
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent changeset that wrote any row for `key`.
    pub fn last_changed(&self, key: &str) -> Option<ChangesetId> {
        self.history.get(key).map(|h| h.last_changed)
    }

    /// Most recent changeset in which `actor` wrote `key`.
    pub fn last_written_by(&self, key: &str, actor: ActorId) -> Option<ChangesetId> {
        self.history
            .get(key)
            .and_then(|h| h.by_actor.get(&actor).copied())
    }

    /// Whether the asset currently carries an active `lost` marker.
    pub fn is_lost(&self) -> bool {
        self.contains_key(LOST_KEY)
    }

    /// Rebuild from parts, used when a view crosses a process boundary.
    pub(crate) fn from_parts(
        entries: BTreeMap<String, Vec<CurrentValue>>,
        history: BTreeMap<String, KeyHistory>,
    ) -> Self {
        Self { entries, history }
    }
}

fn persisted(facts: &[Fact]) -> impl Iterator<Item = (Position, &Fact)> + Clone {
    facts.iter().map(|f| {
        let row = Row::Persisted(f.id.unwrap_or(FactId(i64::MAX)));
        ((f.changeset_id, row), f)
    })
}

fn staged(facts: &[Fact]) -> impl Iterator<Item = (Position, &Fact)> + Clone {
    facts
        .iter()
        .enumerate()
        .map(|(i, f)| ((f.changeset_id, Row::Staged(i)), f))
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Outcome of a persist step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistReport {
    /// Keys whose active value set changed.
    pub changed_keys: BTreeSet<String>,
    /// Rows written, with store-assigned ids.
    pub rows: Vec<Fact>,
    pub inserted: usize,
    pub removed: usize,
}

impl PersistReport {
    pub fn is_noop(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Merge state for one asset: persisted history plus uncommitted facts.
#[derive(Debug, Clone)]
pub struct FactMerge {
    asset_id: AssetId,
    loaded: Vec<Fact>,
    staged: Vec<Fact>,
}

impl FactMerge {
    /// Start from an asset's persisted history, ordered or not.
    pub fn new(asset_id: AssetId, loaded: Vec<Fact>) -> Self {
        Self {
            asset_id,
            loaded,
            staged: Vec::new(),
        }
    }

    /// Load an asset's history from the store.
    pub async fn load(store: &dyn FactStore, asset_id: AssetId) -> Result<Self> {
        Ok(Self::new(asset_id, store.load_facts(asset_id).await?))
    }

    pub fn asset_id(&self) -> AssetId {
        self.asset_id
    }

    pub fn loaded(&self) -> &[Fact] {
        &self.loaded
    }

    pub fn staged(&self) -> &[Fact] {
        &self.staged
    }

    /// Queue facts proposed by the running actor.
    pub fn stage(&mut self, facts: impl IntoIterator<Item = Fact>) {
        self.staged.extend(facts);
    }

    /// Drop uncommitted facts.
    pub fn discard(&mut self) {
        self.staged.clear();
    }

    /// View of persisted facts only.
    pub fn loaded_view(&self) -> CurrentView {
        CurrentView::build(persisted(&self.loaded))
    }

    /// View of persisted plus staged facts.
    pub fn current(&self) -> CurrentView {
        CurrentView::build(persisted(&self.loaded).chain(staged(&self.staged)))
    }

    /// Keys whose active value set differs once staged facts are applied.
    pub fn changed_keys(&self) -> BTreeSet<String> {
        if self.staged.is_empty() {
            return BTreeSet::new();
        }
        let before = self.loaded_view();
        let after = self.current();
        let keys: BTreeSet<&str> = before.keys().chain(after.keys()).collect();
        keys.into_iter()
            .filter(|k| !same_members(before.get(k), after.get(k)))
            .map(str::to_string)
            .collect()
    }

    /// Minimal rows turning the loaded view into the current view.
    ///
    /// A value that becomes active, or stays active but changes attributing
    /// actor, yields one assertion. A value that stops being active yields
    /// one tombstone. Everything else yields nothing.
    pub fn diff(&self) -> Vec<Fact> {
        if self.staged.is_empty() {
            return Vec::new();
        }
        let before = resolve(persisted(&self.loaded));
        let after = resolve(persisted(&self.loaded).chain(staged(&self.staged)));

        let mut rows: Vec<(Position, Fact)> = Vec::new();
        for (key, group) in &after {
            for (value, winner) in group {
                let prior = before.get(key).and_then(|g| g.get(value));
                let was_active = prior.is_some_and(|w| !w.fact.removed);
                let is_active = !winner.fact.removed;
                let reattributed = match prior {
                    Some(p) => was_active && is_active && p.fact.actor_id != winner.fact.actor_id,
                    None => false,
                };
                if was_active != is_active || reattributed {
                    let mut row = winner.fact.clone();
                    row.id = None;
                    rows.push((winner.pos, row));
                }
            }
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, f)| f).collect()
    }

    /// Fold persisted diff rows into the loaded history and clear the stage.
    pub fn commit(&mut self, rows: Vec<Fact>, ids: &[FactId]) -> PersistReport {
        let changed_keys = self.changed_keys();
        let rows: Vec<Fact> = rows
            .into_iter()
            .zip(ids.iter().copied())
            .map(|(fact, id)| fact.with_id(id))
            .collect();
        let removed = rows.iter().filter(|f| f.removed).count();
        self.loaded.extend(rows.iter().cloned());
        self.staged.clear();
        PersistReport {
            changed_keys,
            inserted: rows.len() - removed,
            removed,
            rows,
        }
    }

    /// Diff, append, and commit. An unchanged view writes nothing.
    pub async fn persist(&mut self, store: &dyn FactStore) -> Result<PersistReport> {
        let rows = self.diff();
        if rows.is_empty() {
            self.staged.clear();
            return Ok(PersistReport::default());
        }
        let ids = store.append_facts(&rows).await?;
        let report = self.commit(rows, &ids);
        debug!(
            asset_id = %self.asset_id,
            inserted = report.inserted,
            removed = report.removed,
            changed = report.changed_keys.len(),
            "persisted facts"
        );
        Ok(report)
    }
}

fn same_members(a: &[CurrentValue], b: &[CurrentValue]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| y.value == x.value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetcat_shared::{Changeset, ChangesetStatus};
    use assetcat_storage::MemoryStore;

    const K: &str = "tag";

    fn fact(
        id: i64,
        value: &str,
        actor: i64,
        cs: i64,
        removed: bool,
        asset: AssetId,
    ) -> Fact {
        let f = if removed {
            Fact::tombstone(asset, K, Value::from(value), ActorId(actor), ChangesetId(cs))
        } else {
            Fact::assert(asset, K, Value::from(value), ActorId(actor), ChangesetId(cs))
        };
        f.with_id(FactId(id))
    }

    fn values(view: &CurrentView, key: &str) -> Vec<Value> {
        view.get(key).iter().map(|v| v.value.clone()).collect()
    }

    #[test]
    fn same_value_from_two_actors_collapses_to_latest() {
        let asset = AssetId::new();
        let facts = vec![
            fact(1, "a", 1, 1, false, asset),
            fact(2, "a", 2, 2, false, asset),
        ];
        let view = CurrentView::from_facts(&facts);
        assert_eq!(
            view.get(K),
            &[CurrentValue {
                value: Value::from("a"),
                actor_id: ActorId(2),
                changeset_id: ChangesetId(2),
            }]
        );
    }

    #[test]
    fn tombstone_removes_only_its_value() {
        let asset = AssetId::new();
        let facts = vec![
            fact(1, "a", 1, 1, false, asset),
            fact(2, "b", 1, 1, false, asset),
            fact(3, "a", 1, 2, true, asset),
        ];
        let view = CurrentView::from_facts(&facts);
        assert_eq!(
            view.get(K),
            &[CurrentValue {
                value: Value::from("b"),
                actor_id: ActorId(1),
                changeset_id: ChangesetId(1),
            }]
        );
    }

    #[test]
    fn values_ordered_most_recent_first() {
        let asset = AssetId::new();
        let facts = vec![
            fact(1, "a", 1, 1, false, asset),
            fact(2, "b", 1, 2, false, asset),
            fact(3, "c", 1, 2, false, asset),
            fact(4, "a", 2, 3, false, asset),
        ];
        let view = CurrentView::from_facts(&facts);
        assert_eq!(
            values(&view, K),
            vec![Value::from("a"), Value::from("c"), Value::from("b")]
        );
    }

    #[test]
    fn row_id_breaks_ties_within_a_changeset() {
        let asset = AssetId::new();
        // Actor 2 removes "a" after actor 1 re-asserted it in the same changeset.
        let removal_last = vec![
            fact(1, "a", 1, 1, false, asset),
            fact(2, "a", 1, 2, false, asset),
            fact(3, "a", 2, 2, true, asset),
        ];
        assert!(CurrentView::from_facts(&removal_last).get(K).is_empty());

        let assert_last = vec![
            fact(1, "a", 1, 1, false, asset),
            fact(2, "a", 2, 2, true, asset),
            fact(3, "a", 1, 2, false, asset),
        ];
        assert_eq!(values(&CurrentView::from_facts(&assert_last), K), vec![Value::from("a")]);
    }

    #[test]
    fn merge_is_independent_of_row_arrival_order() {
        let asset = AssetId::new();
        let mut facts = vec![
            fact(1, "a", 1, 1, false, asset),
            fact(2, "b", 2, 1, false, asset),
            fact(5, "a", 2, 3, true, asset),
            fact(3, "c", 1, 2, false, asset),
            fact(4, "b", 1, 2, false, asset),
        ];
        let forward = CurrentView::from_facts(&facts);
        facts.reverse();
        assert_eq!(CurrentView::from_facts(&facts), forward);
    }

    #[test]
    fn replaying_history_as_staged_matches_loaded() {
        let asset = AssetId::new();
        let history = vec![
            fact(1, "a", 1, 1, false, asset),
            fact(2, "b", 1, 1, false, asset),
            fact(3, "a", 2, 2, false, asset),
            fact(4, "b", 1, 3, true, asset),
            fact(5, "c", 2, 3, false, asset),
            fact(6, "b", 2, 4, false, asset),
        ];
        let from_history = CurrentView::from_facts(&history);

        let mut replay = FactMerge::new(asset, Vec::new());
        for cs in 1..=4 {
            replay.stage(
                history
                    .iter()
                    .filter(|f| f.changeset_id == ChangesetId(cs))
                    .map(|f| Fact { id: None, ..f.clone() }),
            );
        }
        assert_eq!(replay.current(), from_history);
    }

    #[test]
    fn key_history_tracks_last_change_per_actor() {
        let asset = AssetId::new();
        let facts = vec![
            fact(1, "a", 1, 1, false, asset),
            fact(2, "a", 2, 3, true, asset),
        ];
        let view = CurrentView::from_facts(&facts);
        assert!(!view.contains_key(K));
        assert_eq!(view.last_changed(K), Some(ChangesetId(3)));
        assert_eq!(view.last_written_by(K, ActorId(1)), Some(ChangesetId(1)));
        assert_eq!(view.last_written_by(K, ActorId(3)), None);
    }

    #[test]
    fn empty_stage_is_noop() {
        let asset = AssetId::new();
        let merge = FactMerge::new(asset, vec![fact(1, "a", 1, 1, false, asset)]);
        assert!(merge.diff().is_empty());
        assert!(merge.changed_keys().is_empty());
        assert_eq!(merge.current(), merge.loaded_view());
    }

    #[test]
    fn reasserting_own_value_writes_nothing() {
        let asset = AssetId::new();
        let mut merge = FactMerge::new(asset, vec![fact(1, "a", 1, 1, false, asset)]);
        merge.stage([Fact::assert(asset, K, Value::from("a"), ActorId(1), ChangesetId(2))]);
        assert!(merge.diff().is_empty());
        assert!(merge.changed_keys().is_empty());
    }

    #[test]
    fn clearing_unset_key_writes_nothing() {
        let asset = AssetId::new();
        let mut merge = FactMerge::new(asset, Vec::new());
        merge.stage([Fact::tombstone(asset, K, Value::from("a"), ActorId(1), ChangesetId(1))]);
        assert!(merge.diff().is_empty());
    }

    #[test]
    fn diff_emits_additions_and_tombstones() {
        let asset = AssetId::new();
        let mut merge = FactMerge::new(
            asset,
            vec![
                fact(1, "a", 1, 1, false, asset),
                fact(2, "b", 1, 1, false, asset),
            ],
        );
        merge.stage([
            Fact::tombstone(asset, K, Value::from("a"), ActorId(1), ChangesetId(2)),
            Fact::assert(asset, K, Value::from("b"), ActorId(1), ChangesetId(2)),
            Fact::assert(asset, K, Value::from("c"), ActorId(1), ChangesetId(2)),
        ]);
        let rows = merge.diff();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].removed && rows[0].value == Value::from("a"));
        assert!(!rows[1].removed && rows[1].value == Value::from("c"));
        assert!(rows.iter().all(|r| r.changeset_id == ChangesetId(2) && r.id.is_none()));
        assert_eq!(merge.changed_keys(), BTreeSet::from([K.to_string()]));
    }

    #[test]
    fn reattribution_is_written_but_not_a_change() {
        let asset = AssetId::new();
        let mut merge = FactMerge::new(asset, vec![fact(1, "a", 1, 1, false, asset)]);
        merge.stage([Fact::assert(asset, K, Value::from("a"), ActorId(2), ChangesetId(2))]);
        let rows = merge.diff();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].actor_id, ActorId(2));
        assert!(merge.changed_keys().is_empty());
    }

    #[tokio::test]
    async fn persist_then_persist_again_is_idempotent() {
        let store = MemoryStore::new();
        let cs = store.next_changeset_id().await.unwrap();
        store
            .save_changeset(&Changeset {
                id: cs,
                status: ChangesetStatus::InProgress,
                message: String::new(),
                actors: vec![ActorId(1)],
                started_at: chrono::Utc::now(),
                finished_at: None,
                stats: Default::default(),
            })
            .await
            .unwrap();
        let asset = AssetId::new();
        let mut merge = FactMerge::new(asset, Vec::new());
        merge.stage([
            Fact::assert(asset, K, Value::from("a"), ActorId(1), cs),
            Fact::assert(asset, "size", Value::Integer(3), ActorId(1), cs),
        ]);
        let report = merge.persist(&store).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.changed_keys.len(), 2);
        assert!(report.rows.iter().all(|r| r.id.is_some()));

        merge.stage([
            Fact::assert(asset, K, Value::from("a"), ActorId(1), cs),
            Fact::assert(asset, "size", Value::Integer(3), ActorId(1), cs),
        ]);
        let again = merge.persist(&store).await.unwrap();
        assert!(again.is_noop());
        assert!(again.changed_keys.is_empty());
        assert_eq!(store.fact_count().unwrap(), 2);

        let reloaded = FactMerge::load(&store, asset).await.unwrap();
        assert_eq!(reloaded.current(), merge.current());
    }
}
