//! Worker protocol: newline-delimited JSON over stdin/stdout.
//!
//! ```text
//! parent → worker: {"type":"seed","attributes":[{"id":1,"key":"path"}]}
//! worker → parent: {"type":"ready"}
//! parent → worker: {"type":"run","id":1,"actor":{..},"asset":{..},"changeset":3,"view":{..}}
//! worker → parent: {"type":"outcome","id":1,"outcome":{"status":"completed","facts":[..]}}
//! parent → worker: {"type":"shutdown"}
//! ```
//!
//! Attribute keys travel as ids from the seeded [`AttributeRegistry`], so both
//! sides must be seeded identically before the first `run`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use assetcat_shared::{
    Actor, ActorId, ActorKind, Asset, AssetId, CatalogError, ChangesetId, Fact, Result, Value,
    ValueKind,
};

use crate::merge::{CurrentValue, CurrentView, KeyHistory};
use crate::registry::AttributeRegistry;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Seed {
        attributes: Vec<WireAttribute>,
    },
    Run {
        id: u64,
        actor: WireActor,
        asset: WireAsset,
        changeset: i64,
        view: WireView,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ready,
    Outcome { id: u64, outcome: WireOutcome },
    /// Protocol-level failure; `id` is absent when no request could be matched.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WireOutcome {
    Completed { facts: Vec<WireFact> },
    Skipped { reason: String },
    Error { reason: String },
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAttribute {
    pub id: u32,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireActor {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub plugin: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAsset {
    pub id: String,
    pub namespace: String,
    pub external_id: String,
    pub locator: String,
    pub created_by: i64,
    pub created_in: i64,
}

/// A typed value as kind tag plus lossless text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireValue {
    pub kind: String,
    pub text: String,
}

/// A fact produced by a unit. Asset, actor and changeset are implied by the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFact {
    pub key: u32,
    pub value: WireValue,
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCurrentValue {
    pub value: WireValue,
    pub actor: i64,
    pub changeset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireKey {
    pub key: u32,
    pub values: Vec<WireCurrentValue>,
    pub last_changed: i64,
    /// `(actor, changeset)` pairs.
    pub writers: Vec<(i64, i64)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireView {
    pub keys: Vec<WireKey>,
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

fn unknown_id(id: u32) -> CatalogError {
    CatalogError::Worker(format!("attribute id {id} is not seeded"))
}

fn unknown_key(key: &str) -> CatalogError {
    CatalogError::Worker(format!("attribute `{key}` is not seeded"))
}

pub fn encode_attributes(registry: &AttributeRegistry) -> Vec<WireAttribute> {
    registry
        .entries()
        .map(|(id, key)| WireAttribute {
            id,
            key: key.to_string(),
        })
        .collect()
}

pub fn decode_attributes(attributes: Vec<WireAttribute>) -> Result<AttributeRegistry> {
    AttributeRegistry::from_entries(attributes.into_iter().map(|a| (a.id, a.key)))
}

pub fn encode_value(value: &Value) -> WireValue {
    WireValue {
        kind: value.kind().as_str().to_string(),
        text: value.encode(),
    }
}

pub fn decode_value(value: &WireValue) -> Result<Value> {
    Value::decode(ValueKind::parse(&value.kind)?, &value.text)
}

pub fn encode_actor(actor: &Actor) -> WireActor {
    WireActor {
        id: actor.id.0,
        name: actor.name.clone(),
        kind: actor.kind.as_str().to_string(),
        plugin: actor.plugin.clone(),
        config: actor.config.clone(),
    }
}

pub fn decode_actor(actor: WireActor) -> Result<Actor> {
    Ok(Actor {
        id: ActorId(actor.id),
        kind: ActorKind::parse(&actor.kind)?,
        name: actor.name,
        plugin: actor.plugin,
        config: actor.config,
    })
}

pub fn encode_asset(asset: &Asset) -> WireAsset {
    WireAsset {
        id: asset.id.to_string(),
        namespace: asset.namespace.clone(),
        external_id: asset.external_id.clone(),
        locator: asset.locator.to_string(),
        created_by: asset.created_by.0,
        created_in: asset.created_in.0,
    }
}

pub fn decode_asset(asset: WireAsset) -> Result<Asset> {
    let id: AssetId = asset
        .id
        .parse()
        .map_err(|e| CatalogError::Worker(format!("bad asset id {:?}: {e}", asset.id)))?;
    let locator = asset
        .locator
        .parse()
        .map_err(|e| CatalogError::Worker(format!("bad locator {:?}: {e}", asset.locator)))?;
    Ok(Asset {
        id,
        namespace: asset.namespace,
        external_id: asset.external_id,
        locator,
        created_by: ActorId(asset.created_by),
        created_in: ChangesetId(asset.created_in),
    })
}

/// Encode the slice of `view` under `keys`. Keys absent from the view are skipped.
pub fn encode_view<'a>(
    view: &CurrentView,
    keys: impl IntoIterator<Item = &'a String>,
    registry: &AttributeRegistry,
) -> Result<WireView> {
    let mut out = Vec::new();
    for key in keys {
        let Some(history) = view.history().get(key) else {
            continue;
        };
        let id = registry.id(key).ok_or_else(|| unknown_key(key))?;
        out.push(WireKey {
            key: id,
            values: view
                .get(key)
                .iter()
                .map(|v| WireCurrentValue {
                    value: encode_value(&v.value),
                    actor: v.actor_id.0,
                    changeset: v.changeset_id.0,
                })
                .collect(),
            last_changed: history.last_changed.0,
            writers: history
                .by_actor
                .iter()
                .map(|(actor, cs)| (actor.0, cs.0))
                .collect(),
        });
    }
    Ok(WireView { keys: out })
}

pub fn decode_view(view: WireView, registry: &AttributeRegistry) -> Result<CurrentView> {
    let mut entries = BTreeMap::new();
    let mut history = BTreeMap::new();
    for wire in view.keys {
        let key = registry.key(wire.key).ok_or_else(|| unknown_id(wire.key))?;
        let values = wire
            .values
            .iter()
            .map(|v| {
                Ok(CurrentValue {
                    value: decode_value(&v.value)?,
                    actor_id: ActorId(v.actor),
                    changeset_id: ChangesetId(v.changeset),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if !values.is_empty() {
            entries.insert(key.to_string(), values);
        }
        history.insert(
            key.to_string(),
            KeyHistory {
                last_changed: ChangesetId(wire.last_changed),
                by_actor: wire
                    .writers
                    .into_iter()
                    .map(|(a, c)| (ActorId(a), ChangesetId(c)))
                    .collect(),
            },
        );
    }
    Ok(CurrentView::from_parts(entries, history))
}

pub fn encode_facts(facts: &[Fact], registry: &AttributeRegistry) -> Result<Vec<WireFact>> {
    facts
        .iter()
        .map(|f| {
            Ok(WireFact {
                key: registry.id(&f.key).ok_or_else(|| unknown_key(&f.key))?,
                value: encode_value(&f.value),
                removed: f.removed,
            })
        })
        .collect()
}

/// Rebuild staged facts for the run they were produced in.
pub fn decode_facts(
    facts: Vec<WireFact>,
    registry: &AttributeRegistry,
    asset_id: AssetId,
    actor_id: ActorId,
    changeset_id: ChangesetId,
) -> Result<Vec<Fact>> {
    facts
        .into_iter()
        .map(|f| {
            let key = registry.key(f.key).ok_or_else(|| unknown_id(f.key))?;
            Ok(Fact {
                id: None,
                asset_id,
                key: key.to_string(),
                actor_id,
                changeset_id,
                value: decode_value(&f.value)?,
                removed: f.removed,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetcat_shared::FactId;

    fn registry() -> AttributeRegistry {
        let mut reg = AttributeRegistry::new();
        for key in ["lost", "path", "sha256"] {
            reg.insert(key);
        }
        reg
    }

    #[test]
    fn request_frames_are_tagged() {
        let line = serde_json::to_string(&Request::Shutdown).unwrap();
        assert_eq!(line, r#"{"type":"shutdown"}"#);
        let ready: Response = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(ready, Response::Ready);
    }

    #[test]
    fn view_survives_the_boundary() {
        let asset = AssetId::new();
        let facts = vec![
            Fact::assert(asset, "path", Value::from("/a"), ActorId(1), ChangesetId(1))
                .with_id(FactId(1)),
            Fact::assert(asset, "sha256", Value::from("00"), ActorId(2), ChangesetId(1))
                .with_id(FactId(2)),
            Fact::tombstone(asset, "sha256", Value::from("00"), ActorId(2), ChangesetId(2))
                .with_id(FactId(3)),
        ];
        let view = CurrentView::from_facts(&facts);
        let reg = registry();
        let keys: Vec<String> = vec!["path".into(), "sha256".into()];
        let wire = encode_view(&view, &keys, &reg).unwrap();
        let json = serde_json::to_string(&wire).unwrap();
        let back = decode_view(serde_json::from_str(&json).unwrap(), &reg).unwrap();
        assert_eq!(back, view);
    }

    #[test]
    fn unseeded_keys_are_rejected() {
        let reg = registry();
        let fact = Fact::assert(AssetId::new(), "mime", Value::from("x"), ActorId(1), ChangesetId(1));
        assert!(encode_facts(&[fact], &reg).is_err());
        let wire = WireFact {
            key: 99,
            value: encode_value(&Value::Integer(1)),
            removed: false,
        };
        assert!(decode_facts(vec![wire], &reg, AssetId::new(), ActorId(1), ChangesetId(1)).is_err());
    }
}
