//! Core domain types: assets, actors, changesets, and fact rows.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{CatalogError, Result};

/// Reserved attribute written when an asset is not re-observed by its source.
pub const LOST_KEY: &str = "lost";

/// Reserved attribute recording that a unit re-ran without changing its outputs.
pub const RUN_KEY: &str = "unit_run";

/// Text prefix for NaN floats, which are stored by bit pattern.
const NAN_PREFIX: &str = "nan:";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for asset identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub Uuid);

impl AssetId {
    /// Generate a new time-sortable asset identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for AssetId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AssetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

numeric_id!(
    /// Stable numeric identifier of a configured actor.
    ActorId
);
numeric_id!(
    /// Monotonically increasing versioning epoch identifier.
    ChangesetId
);
numeric_id!(
    /// Row id assigned by the fact store on append.
    FactId
);

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Discriminant of a [`Value`], as persisted next to its encoded text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Integer,
    Float,
    DateTime,
    Json,
    Relation,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::DateTime => "datetime",
            Self::Json => "json",
            Self::Relation => "relation",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(Self::String),
            "integer" => Ok(Self::Integer),
            "float" => Ok(Self::Float),
            "datetime" => Ok(Self::DateTime),
            "json" => Ok(Self::Json),
            "relation" => Ok(Self::Relation),
            other => Err(CatalogError::validation(format!("unknown value kind `{other}`"))),
        }
    }
}

/// A typed attribute value.
///
/// Equality is identity: floats compare bitwise, JSON compares structurally.
/// This keeps `Eq` and `Hash` lawful so values can group facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    DateTime(DateTime<Utc>),
    Json(serde_json::Value),
    Relation(AssetId),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::String(_) => ValueKind::String,
            Self::Integer(_) => ValueKind::Integer,
            Self::Float(_) => ValueKind::Float,
            Self::DateTime(_) => ValueKind::DateTime,
            Self::Json(_) => ValueKind::Json,
            Self::Relation(_) => ValueKind::Relation,
        }
    }

    /// Lossless text encoding; pair with [`Value::decode`].
    pub fn encode(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) if f.is_nan() => format!("{NAN_PREFIX}{:016x}", f.to_bits()),
            Self::Float(f) => f.to_string(),
            Self::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Self::Json(j) => j.to_string(),
            Self::Relation(id) => id.to_string(),
        }
    }

    /// Rebuild a value from its kind and [`Value::encode`] text.
    pub fn decode(kind: ValueKind, text: &str) -> Result<Self> {
        let bad = |e: &dyn std::fmt::Display| {
            CatalogError::validation(format!("invalid {} value {text:?}: {e}", kind.as_str()))
        };
        Ok(match kind {
            ValueKind::String => Self::String(text.to_string()),
            ValueKind::Integer => Self::Integer(text.parse().map_err(|e| bad(&e))?),
            ValueKind::Float => match text.strip_prefix(NAN_PREFIX) {
                Some(bits) => Self::Float(f64::from_bits(
                    u64::from_str_radix(bits, 16).map_err(|e| bad(&e))?,
                )),
                None => Self::Float(text.parse().map_err(|e| bad(&e))?),
            },
            ValueKind::DateTime => Self::DateTime(
                DateTime::parse_from_rfc3339(text)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| bad(&e))?,
            ),
            ValueKind::Json => Self::Json(serde_json::from_str(text).map_err(|e| bad(&e))?),
            ValueKind::Relation => Self::Relation(text.parse().map_err(|e| bad(&e))?),
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::DateTime(a), Self::DateTime(b)) => a == b,
            (Self::Json(a), Self::Json(b)) => a == b,
            (Self::Relation(a), Self::Relation(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::String(s) => s.hash(state),
            Self::Integer(i) => i.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::DateTime(dt) => dt.hash(state),
            // serde_json maps are ordered, so the rendering is canonical.
            Self::Json(j) => j.to_string().hash(state),
            Self::Relation(id) => id.hash(state),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            other => f.write_str(&other.encode()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

// ---------------------------------------------------------------------------
// Fact
// ---------------------------------------------------------------------------

/// One immutable EAV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Assigned by the store on append; `None` while staged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FactId>,
    pub asset_id: AssetId,
    pub key: String,
    pub actor_id: ActorId,
    pub changeset_id: ChangesetId,
    pub value: Value,
    /// Tombstone for this one value, not for the whole key.
    pub removed: bool,
}

impl Fact {
    /// A staged assertion of `value` under `key`.
    pub fn assert(
        asset_id: AssetId,
        key: impl Into<String>,
        value: Value,
        actor_id: ActorId,
        changeset_id: ChangesetId,
    ) -> Self {
        Self {
            id: None,
            asset_id,
            key: key.into(),
            actor_id,
            changeset_id,
            value,
            removed: false,
        }
    }

    /// A staged tombstone suppressing `value` under `key`.
    pub fn tombstone(
        asset_id: AssetId,
        key: impl Into<String>,
        value: Value,
        actor_id: ActorId,
        changeset_id: ChangesetId,
    ) -> Self {
        Self {
            removed: true,
            ..Self::assert(asset_id, key, value, actor_id, changeset_id)
        }
    }

    /// Same row with a store-assigned id.
    pub fn with_id(mut self, id: FactId) -> Self {
        self.id = Some(id);
        self
    }
}

// ---------------------------------------------------------------------------
// Asset
// ---------------------------------------------------------------------------

/// A cataloged asset. Identity is immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    /// Identity namespace, usually the discovering source's name.
    pub namespace: String,
    /// Identifier unique within the namespace.
    pub external_id: String,
    /// Canonical locator (file URL, web URL, document URI).
    pub locator: Url,
    /// Actor that first discovered the asset.
    pub created_by: ActorId,
    /// Changeset in which the asset was first discovered.
    pub created_in: ChangesetId,
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Role an actor plays in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Source,
    Processor,
    Analyzer,
    Editor,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Processor => "processor",
            Self::Analyzer => "analyzer",
            Self::Editor => "editor",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "source" => Ok(Self::Source),
            "processor" => Ok(Self::Processor),
            "analyzer" => Ok(Self::Analyzer),
            "editor" => Ok(Self::Editor),
            other => Err(CatalogError::config(format!("unknown actor kind `{other}`"))),
        }
    }

    /// Whether actors of this kind enumerate assets rather than enrich them.
    pub fn is_source(&self) -> bool {
        matches!(self, Self::Source)
    }
}

/// An actor definition before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorSpec {
    pub name: String,
    pub kind: ActorKind,
    /// Registry identifier of the plugin implementing this actor.
    pub plugin: String,
    /// Plugin-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A registered actor with its stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub name: String,
    pub kind: ActorKind,
    pub plugin: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Changeset
// ---------------------------------------------------------------------------

/// Lifecycle status of a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesetStatus {
    InProgress,
    Completed,
    Partial,
    Failed,
    Canceled,
}

impl ChangesetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(CatalogError::validation(format!(
                "unknown changeset status `{other}`"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Rows written for one attribute key within a changeset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCounts {
    pub inserted: u64,
    pub removed: u64,
}

/// A contained per-unit failure, surfaced in changeset statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitErrorRecord {
    pub actor_id: ActorId,
    pub unit: String,
    pub asset_id: AssetId,
    pub message: String,
}

/// Summary statistics of a changeset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangesetStats {
    pub assets_seen: u64,
    pub assets_added: u64,
    pub assets_updated: u64,
    pub assets_lost: u64,
    pub units_run: u64,
    pub units_skipped: u64,
    pub rows_inserted: u64,
    pub rows_removed: u64,
    #[serde(default)]
    pub counts_by_key: BTreeMap<String, KeyCounts>,
    #[serde(default)]
    pub unit_errors: Vec<UnitErrorRecord>,
    #[serde(default)]
    pub scan_errors: Vec<String>,
}

impl ChangesetStats {
    /// Account for one persisted fact row.
    pub fn record_row(&mut self, fact: &Fact) {
        let counts = self.counts_by_key.entry(fact.key.clone()).or_default();
        if fact.removed {
            counts.removed += 1;
            self.rows_removed += 1;
        } else {
            counts.inserted += 1;
            self.rows_inserted += 1;
        }
    }

    /// Fold another partial tally (one asset pipeline) into this one.
    pub fn absorb(&mut self, other: ChangesetStats) {
        self.assets_seen += other.assets_seen;
        self.assets_added += other.assets_added;
        self.assets_updated += other.assets_updated;
        self.assets_lost += other.assets_lost;
        self.units_run += other.units_run;
        self.units_skipped += other.units_skipped;
        self.rows_inserted += other.rows_inserted;
        self.rows_removed += other.rows_removed;
        for (key, counts) in other.counts_by_key {
            let entry = self.counts_by_key.entry(key).or_default();
            entry.inserted += counts.inserted;
            entry.removed += counts.removed;
        }
        self.unit_errors.extend(other.unit_errors);
        self.scan_errors.extend(other.scan_errors);
    }
}

/// One versioning epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: ChangesetId,
    pub status: ChangesetStatus,
    pub message: String,
    /// Participating actors, sources first.
    pub actors: Vec<ActorId>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: ChangesetStats,
}
