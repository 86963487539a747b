//! Execution isolator.
//!
//! Runs a processing unit against one asset and returns a typed [`Outcome`].
//! Units run on the blocking thread pool by default; units whose
//! capabilities ask for isolation run in a pool of worker processes so a
//! crash or hang cannot take the changeset down with it.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};

use assetcat_shared::{
    Actor, ActorId, Asset, AssetId, CatalogError, ChangesetId, Fact, Result, RunConfig,
};

use crate::merge::CurrentView;
use crate::registry::AttributeRegistry;
use crate::unit::{Capabilities, ProcessingUnit, UnitContext};
use crate::wire::{self, Request, Response, WireOutcome};

/// Result of one unit execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Vec<Fact>),
    Skipped(String),
    Error(String),
}

/// Everything a unit needs to run against one asset.
#[derive(Clone)]
pub struct Execution {
    pub actor: Actor,
    pub unit: Arc<dyn ProcessingUnit>,
    pub asset: Asset,
    pub changeset_id: ChangesetId,
    pub view: CurrentView,
}

/// Dispatches executions in-process or to worker processes.
pub struct Isolator {
    timeout: Duration,
    pool: Option<WorkerPool>,
}

impl Isolator {
    /// Run everything on the blocking thread pool.
    pub fn in_process(timeout: Duration) -> Self {
        Self {
            timeout,
            pool: None,
        }
    }

    /// Run isolated units in worker processes, the rest in-process.
    pub fn with_workers(timeout: Duration, pool: WorkerPool) -> Self {
        Self {
            timeout,
            pool: Some(pool),
        }
    }

    /// Build from runtime config. Without a worker command the running
    /// executable is used.
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let program = match &config.worker_cmd {
            Some(cmd) => cmd.clone(),
            None => std::env::current_exe()
                .map_err(|e| CatalogError::Worker(format!("cannot locate worker binary: {e}")))?
                .to_string_lossy()
                .into_owned(),
        };
        let pool = WorkerPool::new(
            WorkerCommand {
                program,
                args: config.worker_args.clone(),
            },
            config.workers,
        );
        Ok(Self::with_workers(config.unit_timeout, pool))
    }

    #[instrument(skip_all, fields(actor = %exec.actor.name, asset_id = %exec.asset.id))]
    pub async fn execute(&self, exec: Execution, attributes: &Arc<AttributeRegistry>) -> Outcome {
        let caps = exec.unit.capabilities().clone();
        let asset_id = exec.asset.id;
        let actor_id = exec.actor.id;
        let changeset_id = exec.changeset_id;

        let outcome = match &self.pool {
            Some(pool) if caps.isolated => pool.execute(exec, attributes, self.timeout).await,
            _ => run_in_process(exec, self.timeout).await,
        };

        match outcome {
            Outcome::Completed(facts) => {
                match validate(&facts, &caps, asset_id, actor_id, changeset_id) {
                    Ok(()) => Outcome::Completed(facts),
                    Err(e) => Outcome::Error(e.to_string()),
                }
            }
            other => other,
        }
    }

    /// Stop idle workers.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
    }
}

/// Reject facts outside the unit's declared outputs or for another run.
fn validate(
    facts: &[Fact],
    caps: &Capabilities,
    asset_id: AssetId,
    actor_id: ActorId,
    changeset_id: ChangesetId,
) -> Result<()> {
    for fact in facts {
        if !caps.outputs.contains(&fact.key) {
            return Err(CatalogError::validation(format!(
                "fact for undeclared attribute `{}`",
                fact.key
            )));
        }
        if fact.asset_id != asset_id || fact.actor_id != actor_id || fact.changeset_id != changeset_id
        {
            return Err(CatalogError::validation(format!(
                "fact for `{}` does not belong to this run",
                fact.key
            )));
        }
    }
    Ok(())
}

/// Run a unit synchronously against a view. Shared by the in-process path
/// and the worker loop.
pub(crate) fn run_unit(exec: Execution) -> Outcome {
    let caps = exec.unit.capabilities().clone();
    let mut ctx = UnitContext::new(
        exec.actor.name.clone(),
        exec.asset,
        exec.actor.id,
        exec.changeset_id,
        &caps,
        exec.view,
    );
    match exec.unit.run(&mut ctx) {
        Ok(()) => match ctx.skipped() {
            Some(reason) => Outcome::Skipped(reason.to_string()),
            None => Outcome::Completed(ctx.into_facts()),
        },
        Err(e) => Outcome::Error(e.to_string()),
    }
}

pub(crate) fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("unit task aborted: {err}");
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    format!("unit panicked: {detail}")
}

/// The blocking thread keeps running after a timeout; only its result is dropped.
async fn run_in_process(exec: Execution, timeout: Duration) -> Outcome {
    let task = tokio::task::spawn_blocking(move || run_unit(exec));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join)) => Outcome::Error(panic_message(join)),
        Err(_) => Outcome::Error(format!("unit timed out after {timeout:?}")),
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Executable and arguments that start a worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Handle to one worker process.
struct Worker {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    /// Size of the attribute registry this worker was seeded with.
    seeded: usize,
    request_counter: u64,
}

impl Worker {
    fn spawn(command: &WorkerCommand) -> Result<Self> {
        info!(cmd = %command.program, "spawning worker");
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit()) // Worker logs go to parent stderr
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CatalogError::Worker(format!("failed to spawn `{}`: {e}", command.program))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CatalogError::Worker("failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CatalogError::Worker("failed to capture worker stdout".into()))?;

        Ok(Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            seeded: 0,
            request_counter: 0,
        })
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        let json = serde_json::to_string(request)
            .map_err(|e| CatalogError::Worker(format!("failed to serialize request: {e}")))?;
        self.stdin
            .write_all(format!("{json}\n").as_bytes())
            .await
            .map_err(|e| CatalogError::Worker(format!("failed to write to worker stdin: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| CatalogError::Worker(format!("failed to flush worker stdin: {e}")))
    }

    async fn receive(&mut self) -> Result<Response> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| CatalogError::Worker(format!("worker read error: {e}")))?;
        if read == 0 {
            return Err(CatalogError::Worker("worker closed stdout unexpectedly".into()));
        }
        serde_json::from_str(line.trim()).map_err(|e| {
            CatalogError::Worker(format!(
                "invalid worker frame: {e} (got: {})",
                &line[..line.len().min(200)]
            ))
        })
    }

    async fn seed(&mut self, attributes: &AttributeRegistry) -> Result<()> {
        self.send(&Request::Seed {
            attributes: wire::encode_attributes(attributes),
        })
        .await?;
        match self.receive().await? {
            Response::Ready => {
                self.seeded = attributes.len();
                Ok(())
            }
            other => Err(CatalogError::Worker(format!(
                "expected ready message, got: {other:?}"
            ))),
        }
    }

    async fn run(&mut self, exec: &Execution, attributes: &AttributeRegistry) -> Result<Outcome> {
        if self.seeded != attributes.len() {
            self.seed(attributes).await?;
        }
        self.request_counter += 1;
        let id = self.request_counter;

        let caps = exec.unit.capabilities();
        let keys = caps.dependencies.iter().chain(caps.outputs.iter());
        let request = Request::Run {
            id,
            actor: wire::encode_actor(&exec.actor),
            asset: wire::encode_asset(&exec.asset),
            changeset: exec.changeset_id.0,
            view: wire::encode_view(&exec.view, keys, attributes)?,
        };
        self.send(&request).await?;

        match self.receive().await? {
            Response::Outcome {
                id: resp_id,
                outcome,
            } if resp_id == id => Ok(match outcome {
                WireOutcome::Completed { facts } => Outcome::Completed(wire::decode_facts(
                    facts,
                    attributes,
                    exec.asset.id,
                    exec.actor.id,
                    exec.changeset_id,
                )?),
                WireOutcome::Skipped { reason } => Outcome::Skipped(reason),
                WireOutcome::Error { reason } => Outcome::Error(reason),
            }),
            Response::Error { error, .. } => Err(CatalogError::Worker(error)),
            other => Err(CatalogError::Worker(format!(
                "unexpected worker response: {other:?}"
            ))),
        }
    }

    async fn shutdown(mut self) {
        let _ = self.send(&Request::Shutdown).await;
        match tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "worker exited"),
            Ok(Err(e)) => warn!("worker wait error: {e}"),
            Err(_) => {
                warn!("worker ignored shutdown, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Bounded pool of reusable worker processes.
pub struct WorkerPool {
    command: WorkerCommand,
    slots: Semaphore,
    idle: Mutex<Vec<Worker>>,
}

impl WorkerPool {
    pub fn new(command: WorkerCommand, workers: usize) -> Self {
        Self {
            command,
            slots: Semaphore::new(workers.max(1)),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// A crash, bad frame, or timeout discards the worker and yields
    /// [`Outcome::Error`]; the next execution spawns a fresh one.
    async fn execute(
        &self,
        exec: Execution,
        attributes: &Arc<AttributeRegistry>,
        timeout: Duration,
    ) -> Outcome {
        let _permit = match self.slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Outcome::Error("worker pool is closed".into()),
        };

        let existing = self.idle.lock().await.pop();
        let mut worker = match existing {
            Some(worker) => worker,
            None => match Worker::spawn(&self.command) {
                Ok(worker) => worker,
                Err(e) => return Outcome::Error(e.to_string()),
            },
        };

        let result = tokio::time::timeout(timeout, worker.run(&exec, attributes)).await;
        match result {
            Ok(Ok(outcome)) => {
                self.idle.lock().await.push(worker);
                outcome
            }
            Ok(Err(e)) => {
                warn!(actor = %exec.actor.name, error = %e, "worker failed, discarding");
                let _ = worker.child.kill().await;
                Outcome::Error(e.to_string())
            }
            Err(_) => {
                warn!(actor = %exec.actor.name, ?timeout, "worker timed out, killing");
                let _ = worker.child.kill().await;
                Outcome::Error(format!("worker timed out after {timeout:?}"))
            }
        }
    }

    pub async fn shutdown(&self) {
        let workers: Vec<Worker> = self.idle.lock().await.drain(..).collect();
        for worker in workers {
            worker.shutdown().await;
        }
    }
}
