//! Blocking phase execution. A worker owns its DTR until it reports back.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cache::FileCache;
use crate::config::UrlMapRule;
use crate::delivery::{DataDelivery, TransferControl, TransferTask};
use crate::dtr::{CacheState, Direction, Dtr};
use crate::retry::{DtrError, ErrorKind, ErrorPhase};
use crate::url_model::Locator;

use super::slots::Pool;

#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) delivery: Arc<dyn DataDelivery>,
    pub(crate) cache: Arc<dyn FileCache>,
    pub(crate) url_map: Arc<Vec<UrlMapRule>>,
}

pub(crate) struct WorkerDone {
    pub(crate) dtr: Dtr,
    pub(crate) pool: Pool,
    pub(crate) result: Result<(), DtrError>,
}

pub(crate) fn spawn(
    pool: Pool,
    dtr: Dtr,
    ctx: WorkerContext,
    control: TransferControl,
    done_tx: mpsc::UnboundedSender<WorkerDone>,
) {
    tokio::spawn(async move {
        let fallback = dtr.clone();
        let joined = tokio::task::spawn_blocking(move || run_phase(pool, dtr, &ctx, &control)).await;
        let done = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(dtr_id = %fallback.id, "worker task failed: {}", e);
                WorkerDone {
                    dtr: fallback,
                    pool,
                    result: Err(DtrError::new(ErrorKind::Other, format!("worker task failed: {e}"))),
                }
            }
        };
        let _ = done_tx.send(done);
    });
}

fn run_phase(pool: Pool, mut dtr: Dtr, ctx: &WorkerContext, control: &TransferControl) -> WorkerDone {
    let result = match pool {
        Pool::Processing => pre_process(&mut dtr, ctx, control),
        Pool::Delivery | Pool::Emergency => deliver(&mut dtr, ctx, control),
        Pool::Prepared => post_process(&dtr, ctx, control),
    };
    WorkerDone { dtr, pool, result }
}

/// Replace a configured prefix of the source; `file:` targets must exist.
fn map_source(dtr: &mut Dtr, rules: &[UrlMapRule]) {
    dtr.mapped_source = None;
    for rule in rules {
        let Some(rest) = dtr.source().strip_prefix(rule.from.as_str()) else {
            continue;
        };
        let mapped = format!("{}{}", rule.to, rest);
        let usable = match Locator::parse(&mapped) {
            Ok(loc) => match loc.local_path() {
                Some(path) => path.exists(),
                None => !loc.is_local(),
            },
            Err(_) => false,
        };
        if usable {
            tracing::debug!(dtr_id = %dtr.id, "mapped {} to {}", dtr.source(), mapped);
            dtr.mapped_source = Some(mapped);
            return;
        }
    }
}

fn cache_option(dtr: &Dtr) -> Option<String> {
    Locator::parse(dtr.source())
        .ok()
        .and_then(|l| l.option("cache").map(str::to_string))
}

fn pre_process(dtr: &mut Dtr, ctx: &WorkerContext, control: &TransferControl) -> Result<(), DtrError> {
    control.checkpoint()?;
    if dtr.direction() == Direction::Download {
        map_source(dtr, &ctx.url_map);
    }

    dtr.cache_state = CacheState::NotCacheable;
    let cache_mode = cache_option(dtr);
    let cacheable = dtr.direction() == Direction::Download
        && !dtr.cache.is_empty()
        && dtr.mapped_source.is_none()
        && cache_mode.as_deref() != Some("no");
    if cacheable {
        let url = Locator::parse(dtr.source())
            .map(|l| l.canonical())
            .unwrap_or_else(|_| dtr.source().to_string());
        ctx.cache
            .acquire(&dtr.job_id, &dtr.cache)
            .map_err(|e| DtrError::new(ErrorKind::Storage, format!("cache: {e:#}")))?;
        dtr.cache_state = CacheState::CacheableFresh;
        if cache_mode.as_deref() != Some("renew") {
            if let Some(dest) = dtr.destination_locator().ok().and_then(|l| l.local_path()) {
                match ctx.cache.fetch(&dtr.job_id, &url, &dtr.cache, &dest) {
                    Ok(true) => {
                        tracing::info!(dtr_id = %dtr.id, job_id = %dtr.job_id, "served from cache: {}", url);
                        dtr.cache_state = CacheState::AlreadyPresent;
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(dtr_id = %dtr.id, "cache lookup failed: {:#}", e),
                }
            }
        }
    }

    let task = TransferTask::from_dtr(dtr)?;
    let resolution = ctx.delivery.resolve(&task)?;
    dtr.source_size = resolution.size;
    Ok(())
}

fn deliver(dtr: &mut Dtr, ctx: &WorkerContext, control: &TransferControl) -> Result<(), DtrError> {
    control.checkpoint()?;
    let task = TransferTask::from_dtr(dtr)?;
    let result = ctx.delivery.transfer(&task, control);
    dtr.bytes_transferred = control.bytes();
    result.map_err(|e| e.in_phase(ErrorPhase::Transfer))
}

fn post_process(dtr: &Dtr, ctx: &WorkerContext, control: &TransferControl) -> Result<(), DtrError> {
    control.checkpoint()?;
    let task = TransferTask::from_dtr(dtr)?;
    ctx.delivery
        .register(&task)
        .map_err(|e| e.in_phase(ErrorPhase::PostProcessing))?;
    if dtr.cache_state == CacheState::CacheableFresh {
        if let Some(dest) = task.destination.local_path() {
            let url = Locator::parse(dtr.source())
                .map(|l| l.canonical())
                .unwrap_or_else(|_| dtr.source().to_string());
            if let Err(e) = ctx.cache.store(&dtr.job_id, &url, &dtr.cache, &dest) {
                tracing::warn!(dtr_id = %dtr.id, "failed to add {} to cache: {:#}", url, e);
            }
        }
    }
    Ok(())
}
