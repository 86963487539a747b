//! Shared types, error model, and configuration for assetcat.
//!
//! This crate is the foundation depended on by all other assetcat crates.
//! It provides:
//! - [`CatalogError`]: the unified error type
//! - Domain types ([`Asset`], [`Actor`], [`Changeset`], [`Fact`], [`Value`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    ActorConfig, AppConfig, DefaultsConfig, IsolationConfig, RunConfig, config_dir,
    config_file_path, expand_home, init_config, load_config, load_config_from,
};
pub use error::{CatalogError, ErrorKind, Result};
pub use types::{
    Actor, ActorId, ActorKind, ActorSpec, Asset, AssetId, Changeset, ChangesetId,
    ChangesetStats, ChangesetStatus, Fact, FactId, KeyCounts, LOST_KEY, RUN_KEY,
    UnitErrorRecord, Value, ValueKind,
};
