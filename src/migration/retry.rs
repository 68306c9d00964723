use async_trait::async_trait;
use std::sync::Arc;

use super::check::{is_copying, needs_redirect, strip_phase1};
use super::types::*;
use crate::aggregator::{AttrMode, PrePostMerge};
use crate::error::FopResult;
use crate::fop::{Loc, Reply};
use crate::topology::types::SubvolId;
use crate::transport::Transport;

/// Finds the node a file's data lives on once it left `source`.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve_target(&self, loc: &Loc, source: &SubvolId) -> FopResult<SubvolId>;
}

/// Submits a data operation to the cached node and follows a migration at most once.
///
/// A reply that is `ENOENT` or carries a link file sends the identical request to the
/// resolved target, and whatever the target answers is returned. Copy-in-progress bits
/// never reach the caller.
pub async fn submit(
    transport: &Arc<dyn Transport>,
    resolver: &dyn TargetResolver,
    mut desc: MigrationDescriptor,
) -> Handoff<FopResult<Reply>> {
    let loc = desc.fop.loc().clone();
    let mut result = transport.submit(&desc.from, desc.fop.clone()).await;

    if desc.continuation == Continuation::Fsync && is_copying(&result) {
        return fsync_during_copy(transport, resolver, desc, result).await;
    }

    if needs_redirect(&result) && desc.can_retry() {
        let target = match desc.to.clone() {
            Some(hint) => Ok(hint),
            None => resolver.resolve_target(&loc, &desc.from).await,
        };

        match target {
            Ok(target) => {
                desc.attempt += 1;
                tracing::debug!(
                    "{} of {} moved from {} to {} (attempt {})",
                    desc.fop.name(),
                    loc,
                    desc.from,
                    target,
                    desc.attempt
                );
                result = transport.submit(&target, desc.fop.clone()).await;
                desc.to = Some(target);
            }
            Err(errno) => {
                tracing::debug!("Could not resolve where {} went: {}", loc, errno);
            }
        }
    }

    if let Ok(reply) = result.as_mut() {
        strip_phase1(reply);
    }

    let served_by = match (&desc.to, desc.attempt) {
        (Some(to), attempt) if attempt > 1 => to.clone(),
        _ => desc.from,
    };
    Handoff {
        result,
        served_by,
        attempts: desc.attempt,
        target: desc.to,
    }
}

/// Phase 1 `fsync`: the source answered, but written data must also be durable on the
/// node being copied to. Both pre/post pairs are merged as views of one file; a failure
/// on the target fails the whole `fsync`.
async fn fsync_during_copy(
    transport: &Arc<dyn Transport>,
    resolver: &dyn TargetResolver,
    mut desc: MigrationDescriptor,
    first: FopResult<Reply>,
) -> Handoff<FopResult<Reply>> {
    let loc = desc.fop.loc().clone();
    let mut merge = PrePostMerge::new(AttrMode::File);
    if let Ok(Reply::PrePost { pre, post }) = &first {
        merge.merge_pair(&desc.from, pre, post);
    }

    let target = match desc.to.clone() {
        Some(hint) => Some(hint),
        None => resolver.resolve_target(&loc, &desc.from).await.ok(),
    };

    let mut failed = None;
    if let Some(target) = target
        && desc.can_retry()
    {
        desc.attempt += 1;
        desc.to = Some(target.clone());
        match transport.submit(&target, desc.fop.clone()).await {
            Ok(Reply::PrePost { pre, post }) => merge.merge_pair(&target, &pre, &post),
            Ok(_) => {}
            Err(errno) => {
                tracing::debug!("fsync of {} on copy target {} failed: {}", loc, target, errno);
                failed = Some(errno);
            }
        }
    }

    // Data not durable on the target is not durable at all once the copy completes.
    let result = match failed {
        Some(errno) => Err(errno),
        None => merge.result().map(|(pre, post)| {
            let mut reply = Reply::PrePost { pre, post };
            strip_phase1(&mut reply);
            reply
        }),
    };

    Handoff {
        result,
        served_by: desc.from,
        attempts: desc.attempt,
        target: desc.to,
    }
}
