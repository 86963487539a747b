//! Fact store adapters.
//!
//! [`FactStore`] is the only shared mutable resource of the catalog: durable,
//! append-only storage of fact rows plus the asset/actor/changeset registries
//! around them. It holds no merge logic.
//!
//! Implementations:
//! - [`Storage`]: libSQL database (read-write via [`Storage::open`], read-only
//!   via [`Storage::open_readonly`])
//! - [`MemoryStore`]: in-process store for tests and dry runs

pub mod memory;
mod migrations;

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;

use assetcat_shared::{
    Actor, ActorId, ActorKind, ActorSpec, Asset, AssetId, CatalogError, Changeset, ChangesetId,
    ChangesetStatus, Fact, FactId, Result, Value, ValueKind,
};

pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Durable storage consumed by the merge engine and the changeset controller.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// All facts of an asset, ordered by `(changeset_id, id)`.
    async fn load_facts(&self, asset_id: AssetId) -> Result<Vec<Fact>>;

    /// Append staged facts atomically. Returns the assigned row ids in input
    /// order. Fails if any fact targets a changeset that is not in progress.
    async fn append_facts(&self, facts: &[Fact]) -> Result<Vec<FactId>>;

    /// Allocate the next changeset id from a single incrementing sequence.
    async fn next_changeset_id(&self) -> Result<ChangesetId>;

    /// Assets created by, or carrying facts from, any of `actors`.
    async fn list_active_assets(&self, actors: &[ActorId]) -> Result<Vec<AssetId>>;

    /// Register (or update) an actor by name; the id never changes once assigned.
    async fn register_actor(&self, spec: &ActorSpec) -> Result<Actor>;

    async fn list_actors(&self) -> Result<Vec<Actor>>;

    async fn find_asset(&self, namespace: &str, external_id: &str) -> Result<Option<Asset>>;

    async fn get_asset(&self, id: AssetId) -> Result<Option<Asset>>;

    /// Insert an asset identity. If another writer created the same
    /// `(namespace, external_id)` first, that row is returned instead.
    async fn insert_asset(&self, asset: &Asset) -> Result<Asset>;

    /// Insert or update a changeset record.
    async fn save_changeset(&self, changeset: &Changeset) -> Result<()>;

    async fn get_changeset(&self, id: ChangesetId) -> Result<Option<Changeset>>;

    /// Most recent changesets first.
    async fn list_changesets(&self, limit: u32) -> Result<Vec<Changeset>>;
}

fn store_err(e: impl std::fmt::Display) -> CatalogError {
    CatalogError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// libSQL storage
// ---------------------------------------------------------------------------

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Serializes writes on the shared connection.
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CatalogError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(store_err)?;

        let conn = db.connect().map_err(store_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (status and inspection commands).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(store_err)?;

        let conn = db.connect().map_err(store_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CatalogError::Store(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CatalogError::Store(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    async fn changeset_status(
        conn: &Connection,
        id: ChangesetId,
    ) -> Result<Option<ChangesetStatus>> {
        let mut rows = conn
            .query("SELECT status FROM changesets WHERE id = ?1", params![id.0])
            .await
            .map_err(store_err)?;
        match rows.next().await.map_err(store_err)? {
            Some(row) => {
                let status: String = row.get(0).map_err(store_err)?;
                Ok(Some(ChangesetStatus::parse(&status)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FactStore for Storage {
    async fn load_facts(&self, asset_id: AssetId) -> Result<Vec<Fact>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, asset_id, key, actor_id, changeset_id, value_kind, value_text, removed
                 FROM facts WHERE asset_id = ?1 ORDER BY changeset_id, id",
                params![asset_id.to_string()],
            )
            .await
            .map_err(store_err)?;

        let mut facts = Vec::new();
        while let Some(row) = rows.next().await.map_err(store_err)? {
            facts.push(row_to_fact(&row)?);
        }
        Ok(facts)
    }

    async fn append_facts(&self, facts: &[Fact]) -> Result<Vec<FactId>> {
        self.check_writable()?;
        if facts.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(store_err)?;

        let changesets: BTreeSet<ChangesetId> = facts.iter().map(|f| f.changeset_id).collect();
        for id in changesets {
            match Self::changeset_status(&tx, id).await? {
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
            let mut rows = tx
                .query(
                    "INSERT INTO facts (asset_id, key, actor_id, changeset_id, value_kind, value_text, removed)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     RETURNING id",
                    params![
                        fact.asset_id.to_string(),
                        fact.key.as_str(),
                        fact.actor_id.0,
                        fact.changeset_id.0,
                        fact.value.kind().as_str(),
                        fact.value.encode(),
                        i64::from(fact.removed),
                    ],
                )
                .await
                .map_err(store_err)?;
            let row = rows
                .next()
                .await
                .map_err(store_err)?
                .ok_or_else(|| CatalogError::Store("insert returned no row id".into()))?;
            ids.push(FactId(row.get::<i64>(0).map_err(store_err)?));
        }

        tx.commit().await.map_err(store_err)?;
        tracing::debug!(rows = ids.len(), "appended facts");
        Ok(ids)
    }

    async fn next_changeset_id(&self) -> Result<ChangesetId> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let _guard = self.write_lock.lock().await;
        let mut rows = self
            .conn
            .query(
                "INSERT INTO changeset_seq (allocated_at) VALUES (?1) RETURNING id",
                params![now.as_str()],
            )
            .await
            .map_err(store_err)?;
        let row = rows
            .next()
            .await
            .map_err(store_err)?
            .ok_or_else(|| CatalogError::Store("sequence returned no id".into()))?;
        Ok(ChangesetId(row.get::<i64>(0).map_err(store_err)?))
    }

    async fn list_active_assets(&self, actors: &[ActorId]) -> Result<Vec<AssetId>> {
        let mut found = BTreeSet::new();
        for actor in actors {
            let mut rows = self
                .conn
                .query(
                    "SELECT id FROM assets WHERE created_by = ?1
                     UNION
                     SELECT DISTINCT asset_id FROM facts WHERE actor_id = ?1",
                    params![actor.0],
                )
                .await
                .map_err(store_err)?;
            while let Some(row) = rows.next().await.map_err(store_err)? {
                let id: String = row.get(0).map_err(store_err)?;
                found.insert(parse_asset_id(&id)?);
            }
        }
        Ok(found.into_iter().collect())
    }

    async fn register_actor(&self, spec: &ActorSpec) -> Result<Actor> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO actors (name, kind, plugin, config_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                   kind = excluded.kind,
                   plugin = excluded.plugin,
                   config_json = excluded.config_json",
                params![
                    spec.name.as_str(),
                    spec.kind.as_str(),
                    spec.plugin.as_str(),
                    spec.config.to_string(),
                    now.as_str()
                ],
            )
            .await
            .map_err(store_err)?;

        let mut rows = self
            .conn
            .query(
                "SELECT id, name, kind, plugin, config_json FROM actors WHERE name = ?1",
                params![spec.name.as_str()],
            )
            .await
            .map_err(store_err)?;
        match rows.next().await.map_err(store_err)? {
            Some(row) => row_to_actor(&row),
            None => Err(CatalogError::Store(format!(
                "actor `{}` vanished after registration",
                spec.name
            ))),
        }
    }

    async fn list_actors(&self) -> Result<Vec<Actor>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, kind, plugin, config_json FROM actors ORDER BY id",
                params![],
            )
            .await
            .map_err(store_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(store_err)? {
            results.push(row_to_actor(&row)?);
        }
        Ok(results)
    }

    async fn find_asset(&self, namespace: &str, external_id: &str) -> Result<Option<Asset>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, namespace, external_id, locator, created_by, created_in
                 FROM assets WHERE namespace = ?1 AND external_id = ?2",
                params![namespace, external_id],
            )
            .await
            .map_err(store_err)?;
        match rows.next().await.map_err(store_err)? {
            Some(row) => Ok(Some(row_to_asset(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_asset(&self, id: AssetId) -> Result<Option<Asset>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, namespace, external_id, locator, created_by, created_in
                 FROM assets WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(store_err)?;
        match rows.next().await.map_err(store_err)? {
            Some(row) => Ok(Some(row_to_asset(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_asset(&self, asset: &Asset) -> Result<Asset> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO assets (id, namespace, external_id, locator, created_by, created_in)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(namespace, external_id) DO NOTHING",
                params![
                    asset.id.to_string(),
                    asset.namespace.as_str(),
                    asset.external_id.as_str(),
                    asset.locator.as_str(),
                    asset.created_by.0,
                    asset.created_in.0,
                ],
            )
            .await
            .map_err(store_err)?;

        self.find_asset(&asset.namespace, &asset.external_id)
            .await?
            .ok_or_else(|| CatalogError::Store(format!("asset {} was not stored", asset.id)))
    }

    async fn save_changeset(&self, changeset: &Changeset) -> Result<()> {
        self.check_writable()?;
        let actors_json = serde_json::to_string(&changeset.actors).map_err(store_err)?;
        let stats_json = serde_json::to_string(&changeset.stats).map_err(store_err)?;
        let finished_at = changeset.finished_at.map(|t| t.to_rfc3339());

        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO changesets (id, status, message, actors_json, started_at, finished_at, stats_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   status = excluded.status,
                   finished_at = excluded.finished_at,
                   stats_json = excluded.stats_json",
                params![
                    changeset.id.0,
                    changeset.status.as_str(),
                    changeset.message.as_str(),
                    actors_json,
                    changeset.started_at.to_rfc3339(),
                    finished_at,
                    stats_json,
                ],
            )
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_changeset(&self, id: ChangesetId) -> Result<Option<Changeset>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, status, message, actors_json, started_at, finished_at, stats_json
                 FROM changesets WHERE id = ?1",
                params![id.0],
            )
            .await
            .map_err(store_err)?;
        match rows.next().await.map_err(store_err)? {
            Some(row) => Ok(Some(row_to_changeset(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_changesets(&self, limit: u32) -> Result<Vec<Changeset>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, status, message, actors_json, started_at, finished_at, stats_json
                 FROM changesets ORDER BY id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(store_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(store_err)? {
            results.push(row_to_changeset(&row)?);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn parse_asset_id(s: &str) -> Result<AssetId> {
    s.parse()
        .map_err(|e| CatalogError::Store(format!("invalid asset id {s:?}: {e}")))
}

fn parse_time(s: &str) -> Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CatalogError::Store(format!("invalid date: {e}")))
}

/// Convert a database row to a [`Fact`].
fn row_to_fact(row: &libsql::Row) -> Result<Fact> {
    let asset_id: String = row.get(1).map_err(store_err)?;
    let kind: String = row.get(5).map_err(store_err)?;
    let text: String = row.get(6).map_err(store_err)?;
    Ok(Fact {
        id: Some(FactId(row.get::<i64>(0).map_err(store_err)?)),
        asset_id: parse_asset_id(&asset_id)?,
        key: row.get::<String>(2).map_err(store_err)?,
        actor_id: ActorId(row.get::<i64>(3).map_err(store_err)?),
        changeset_id: ChangesetId(row.get::<i64>(4).map_err(store_err)?),
        value: Value::decode(ValueKind::parse(&kind)?, &text)?,
        removed: row.get::<i64>(7).map_err(store_err)? != 0,
    })
}

/// Convert a database row to an [`Actor`].
fn row_to_actor(row: &libsql::Row) -> Result<Actor> {
    let kind: String = row.get(2).map_err(store_err)?;
    let config: String = row.get(4).map_err(store_err)?;
    Ok(Actor {
        id: ActorId(row.get::<i64>(0).map_err(store_err)?),
        name: row.get::<String>(1).map_err(store_err)?,
        kind: ActorKind::parse(&kind)?,
        plugin: row.get::<String>(3).map_err(store_err)?,
        config: serde_json::from_str(&config).map_err(store_err)?,
    })
}

/// Convert a database row to an [`Asset`].
fn row_to_asset(row: &libsql::Row) -> Result<Asset> {
    let id: String = row.get(0).map_err(store_err)?;
    let locator: String = row.get(3).map_err(store_err)?;
    Ok(Asset {
        id: parse_asset_id(&id)?,
        namespace: row.get::<String>(1).map_err(store_err)?,
        external_id: row.get::<String>(2).map_err(store_err)?,
        locator: locator
            .parse()
            .map_err(|e| CatalogError::Store(format!("invalid locator {locator:?}: {e}")))?,
        created_by: ActorId(row.get::<i64>(4).map_err(store_err)?),
        created_in: ChangesetId(row.get::<i64>(5).map_err(store_err)?),
    })
}

/// Convert a database row to a [`Changeset`].
fn row_to_changeset(row: &libsql::Row) -> Result<Changeset> {
    let status: String = row.get(1).map_err(store_err)?;
    let actors: String = row.get(3).map_err(store_err)?;
    let started_at: String = row.get(4).map_err(store_err)?;
    let finished_at: Option<String> = row.get::<String>(5).ok();
    let stats: Option<String> = row.get::<String>(6).ok();
    Ok(Changeset {
        id: ChangesetId(row.get::<i64>(0).map_err(store_err)?),
        status: ChangesetStatus::parse(&status)?,
        message: row.get::<String>(2).map_err(store_err)?,
        actors: serde_json::from_str(&actors).map_err(store_err)?,
        started_at: parse_time(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_time).transpose()?,
        stats: match stats {
            Some(s) => serde_json::from_str(&s).map_err(store_err)?,
            None => Default::default(),
        },
    })
}

/// Distinct changesets referenced by a batch, for invariant checks in stores.
pub(crate) fn referenced_changesets(facts: &[Fact]) -> HashSet<ChangesetId> {
    facts.iter().map(|f| f.changeset_id).collect()
}
