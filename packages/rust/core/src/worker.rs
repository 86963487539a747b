//! Worker side of the isolation protocol.
//!
//! [`serve`] reads requests line by line, runs units on the blocking pool and
//! writes one response per request. Stdout carries nothing but frames.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use assetcat_shared::{ActorId, CatalogError, ChangesetId, Result};

use crate::isolate::{self, Execution, Outcome};
use crate::registry::{AttributeRegistry, UnitRegistry};
use crate::unit::ProcessingUnit;
use crate::wire::{self, Request, Response, WireActor, WireAsset, WireOutcome, WireView};

/// Serve requests until `shutdown` or end of input.
pub async fn serve<R, W>(registry: &UnitRegistry, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut attributes: Option<Arc<AttributeRegistry>> = None;
    let mut units: HashMap<ActorId, Arc<dyn ProcessingUnit>> = HashMap::new();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| CatalogError::Worker(format!("worker read error: {e}")))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "unreadable request");
                respond(
                    &mut writer,
                    &Response::Error {
                        id: None,
                        error: format!("invalid request: {e}"),
                    },
                )
                .await?;
                continue;
            }
        };

        let response = match request {
            Request::Seed { attributes: seeded } => match wire::decode_attributes(seeded) {
                Ok(registry) => {
                    info!(attributes = registry.len(), "worker seeded");
                    attributes = Some(Arc::new(registry));
                    Response::Ready
                }
                Err(e) => Response::Error {
                    id: None,
                    error: e.to_string(),
                },
            },
            Request::Run {
                id,
                actor,
                asset,
                changeset,
                view,
            } => {
                let outcome = match &attributes {
                    Some(attrs) => {
                        run(registry, &mut units, attrs, actor, asset, changeset, view).await
                    }
                    None => Err(CatalogError::Worker(
                        "run received before attribute seed".into(),
                    )),
                };
                match outcome {
                    Ok(outcome) => Response::Outcome { id, outcome },
                    Err(e) => Response::Error {
                        id: Some(id),
                        error: e.to_string(),
                    },
                }
            }
            Request::Shutdown => {
                debug!("worker shutting down");
                break;
            }
        };
        respond(&mut writer, &response).await?;
    }
    Ok(())
}

async fn run(
    registry: &UnitRegistry,
    units: &mut HashMap<ActorId, Arc<dyn ProcessingUnit>>,
    attributes: &Arc<AttributeRegistry>,
    actor: WireActor,
    asset: WireAsset,
    changeset: i64,
    view: WireView,
) -> Result<WireOutcome> {
    let actor = wire::decode_actor(actor)?;
    let asset = wire::decode_asset(asset)?;
    let view = wire::decode_view(view, attributes)?;

    let unit = match units.get(&actor.id) {
        Some(unit) => Arc::clone(unit),
        None => {
            let unit = registry.build_processor(&actor.plugin, &actor.config)?;
            units.insert(actor.id, Arc::clone(&unit));
            unit
        }
    };

    let exec = Execution {
        actor,
        unit,
        asset,
        changeset_id: ChangesetId(changeset),
        view,
    };
    let outcome = match tokio::task::spawn_blocking(move || isolate::run_unit(exec)).await {
        Ok(outcome) => outcome,
        Err(join) => Outcome::Error(isolate::panic_message(join)),
    };

    Ok(match outcome {
        Outcome::Completed(facts) => WireOutcome::Completed {
            facts: wire::encode_facts(&facts, attributes)?,
        },
        Outcome::Skipped(reason) => WireOutcome::Skipped { reason },
        Outcome::Error(reason) => WireOutcome::Error { reason },
    })
}

async fn respond<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
    let json = serde_json::to_string(response)
        .map_err(|e| CatalogError::Worker(format!("failed to serialize response: {e}")))?;
    writer
        .write_all(format!("{json}\n").as_bytes())
        .await
        .map_err(|e| CatalogError::Worker(format!("failed to write response: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| CatalogError::Worker(format!("failed to flush response: {e}")))
}
