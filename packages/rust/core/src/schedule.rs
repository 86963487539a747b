//! Dependency scheduler.
//!
//! Orders processing units into stages from their declared dependency and
//! output keys, and decides per asset whether a unit must run.
//!
//! Unit B depends on unit A when `A.outputs ∩ B.dependencies` is non-empty.
//! Stage 0 holds units with no producer among the pipeline's units; every
//! other unit sits one stage after its latest producer. Cycles are rejected
//! before any unit executes.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::debug;

use assetcat_shared::{Actor, ActorId, CatalogError, LOST_KEY, RUN_KEY, Result};

use crate::merge::CurrentView;
use crate::unit::{Capabilities, ProcessingUnit, SourceUnit};

// ---------------------------------------------------------------------------
// Run decisions
// ---------------------------------------------------------------------------

/// Why a unit is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    /// Forced rebuild requested by the caller.
    Forced,
    /// A declared output has no active value.
    MissingOutput(String),
    /// This actor never wrote any of its outputs for the asset.
    NeverWritten,
    /// A dependency changed after this actor's last output write.
    InputChanged(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunDecision {
    Run(RunReason),
    Skip,
}

impl RunDecision {
    pub fn should_run(&self) -> bool {
        matches!(self, Self::Run(_))
    }
}

/// Default per-asset execution rule.
///
/// Runs when an output is absent, or when any dependency changed in a later
/// changeset than the actor's most recent write to its outputs. A run that
/// left the outputs unchanged counts as a write through its [`RUN_KEY`] marker.
pub fn should_run(caps: &Capabilities, actor: ActorId, view: &CurrentView) -> RunDecision {
    if let Some(missing) = caps.outputs.iter().find(|k| !view.contains_key(k)) {
        return RunDecision::Run(RunReason::MissingOutput(missing.clone()));
    }

    let last_write = caps
        .outputs
        .iter()
        .filter_map(|k| view.last_written_by(k, actor))
        .max();
    let Some(last_write) = last_write else {
        return RunDecision::Run(RunReason::NeverWritten);
    };
    let last_write = view
        .last_written_by(RUN_KEY, actor)
        .map_or(last_write, |ran| ran.max(last_write));

    for dep in &caps.dependencies {
        if view.last_changed(dep).is_some_and(|changed| changed > last_write) {
            return RunDecision::Run(RunReason::InputChanged(dep.clone()));
        }
    }
    RunDecision::Skip
}

// ---------------------------------------------------------------------------
// Stage assignment
// ---------------------------------------------------------------------------

/// Assign a stage to every unit, in input order.
///
/// `external` lists keys produced outside the staged units (source outputs
/// and reserved keys). A dependency nobody produces is a configuration error.
pub fn assign_stages(
    units: &[(&str, &Capabilities)],
    external: &BTreeSet<String>,
) -> Result<Vec<usize>> {
    let produced: BTreeSet<&str> = units
        .iter()
        .flat_map(|(_, caps)| caps.outputs.iter().map(String::as_str))
        .collect();
    for (name, caps) in units {
        for dep in &caps.dependencies {
            if !produced.contains(dep.as_str()) && !external.contains(dep) {
                return Err(CatalogError::config(format!(
                    "unit `{name}` depends on unknown attribute `{dep}`"
                )));
            }
        }
    }

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..units.len()).map(|i| graph.add_node(i)).collect();
    for (a, (_, producer)) in units.iter().enumerate() {
        for (b, (_, consumer)) in units.iter().enumerate() {
            // A unit reading its own outputs is not a cycle.
            if a != b && !producer.outputs.is_disjoint(&consumer.dependencies) {
                graph.add_edge(nodes[a], nodes[b], ());
            }
        }
    }

    // Kahn's algorithm, layered; ties resolve in input order.
    let mut in_degree: HashMap<NodeIndex, usize> = nodes.iter().map(|&n| (n, 0)).collect();
    for edge in graph.edge_references() {
        *in_degree.entry(edge.target()).or_insert(0) += 1;
    }
    let mut queue: VecDeque<NodeIndex> = nodes
        .iter()
        .filter(|n| in_degree.get(*n).copied().unwrap_or(0) == 0)
        .copied()
        .collect();
    let mut stages = vec![0usize; units.len()];
    let mut visited = 0;

    while let Some(node) = queue.pop_front() {
        visited += 1;
        let mut next: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
        next.sort();
        next.dedup();
        for target in next {
            stages[target.index()] = stages[target.index()].max(stages[node.index()] + 1);
            let edges = graph.edges_connecting(node, target).count();
            if let Some(deg) = in_degree.get_mut(&target) {
                *deg = deg.saturating_sub(edges);
                if *deg == 0 {
                    queue.push_back(target);
                }
            }
        }
    }

    if visited != units.len() {
        let cycle: Vec<&str> = nodes
            .iter()
            .filter(|n| in_degree.get(*n).copied().unwrap_or(0) > 0)
            .map(|n| units[n.index()].0)
            .collect();
        return Err(CatalogError::config(format!(
            "dependency cycle among units: {}",
            cycle.join(", ")
        )));
    }

    Ok(stages)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A resolved source and the actor it runs as.
#[derive(Clone)]
pub struct SourceBinding {
    pub actor: Actor,
    pub unit: Arc<dyn SourceUnit>,
}

impl std::fmt::Debug for SourceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceBinding")
            .field("actor", &self.actor.name)
            .field("capabilities", self.unit.capabilities())
            .finish()
    }
}

/// A resolved processing unit and the actor it runs as.
#[derive(Clone)]
pub struct ScheduledUnit {
    pub actor: Actor,
    pub unit: Arc<dyn ProcessingUnit>,
}

impl std::fmt::Debug for ScheduledUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledUnit")
            .field("actor", &self.actor.name)
            .field("capabilities", self.unit.capabilities())
            .finish()
    }
}

/// Sources plus processing units grouped into stages.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub sources: Vec<SourceBinding>,
    pub stages: Vec<Vec<ScheduledUnit>>,
}

impl Pipeline {
    /// Validate and stage a pipeline. Fails on cycles and unknown keys.
    pub fn build(sources: Vec<SourceBinding>, units: Vec<ScheduledUnit>) -> Result<Self> {
        let mut external: BTreeSet<String> = sources
            .iter()
            .flat_map(|s| s.unit.capabilities().outputs.iter().cloned())
            .collect();
        external.insert(LOST_KEY.to_string());

        let named: Vec<(&str, &Capabilities)> = units
            .iter()
            .map(|u| (u.actor.name.as_str(), u.unit.capabilities()))
            .collect();
        let assignment = assign_stages(&named, &external)?;

        let depth = assignment.iter().copied().max().map_or(0, |m| m + 1);
        let mut stages: Vec<Vec<ScheduledUnit>> = vec![Vec::new(); depth];
        for (unit, stage) in units.into_iter().zip(assignment) {
            stages[stage].push(unit);
        }
        debug!(
            sources = sources.len(),
            stages = stages.len(),
            "pipeline staged"
        );
        Ok(Self { sources, stages })
    }

    pub fn source_actors(&self) -> Vec<ActorId> {
        self.sources.iter().map(|s| s.actor.id).collect()
    }

    /// Every participating actor, sources first.
    pub fn actor_ids(&self) -> Vec<ActorId> {
        self.sources
            .iter()
            .map(|s| s.actor.id)
            .chain(self.stages.iter().flatten().map(|u| u.actor.id))
            .collect()
    }

    /// Every attribute key read or written by the pipeline.
    pub fn attribute_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = BTreeSet::from([LOST_KEY.to_string()]);
        for source in &self.sources {
            keys.extend(source.unit.capabilities().outputs.iter().cloned());
        }
        for unit in self.stages.iter().flatten() {
            let caps = unit.unit.capabilities();
            keys.extend(caps.dependencies.iter().cloned());
            keys.extend(caps.outputs.iter().cloned());
        }
        keys
    }
}
