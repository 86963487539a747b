//! Core changeset engine for assetcat.
//!
//! Sources discover assets, processing units derive attributes from them,
//! and every write lands as an append-only fact. This crate owns:
//! - the merge that folds fact history into a current view ([`merge`])
//! - unit interfaces and staging ([`unit`], [`schedule`])
//! - execution isolation, in-process or in worker processes ([`isolate`])
//! - the changeset lifecycle ([`changeset`])

mod builtin;
pub mod changeset;
pub mod events;
pub mod isolate;
pub mod merge;
pub mod registry;
pub mod schedule;
pub mod unit;
pub mod wire;
pub mod worker;

pub use changeset::{ActiveChangeset, ChangesetController, RunOptions, StatusReport};
pub use events::{EventSink, ProgressEvent, SilentEvents, StageMarker, TerminalEvent, TracingEvents};
pub use isolate::{Execution, Isolator, Outcome, WorkerCommand, WorkerPool};
pub use merge::{CurrentValue, CurrentView, FactMerge, KeyHistory, PersistReport};
pub use registry::{AttributeRegistry, RuntimeContext, UnitRegistry};
pub use schedule::{Pipeline, RunDecision, RunReason};
pub use unit::{
    AssetScan, Capabilities, DiscoveredAsset, ProcessingUnit, SourceUnit, UnitContext,
};
