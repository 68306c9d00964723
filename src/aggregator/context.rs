use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};

use super::merge::Merge;
use crate::error::{Errno, FopResult};
use crate::fop::{Fop, Reply};
use crate::topology::types::SubvolId;
use crate::transport::Transport;

struct Rendezvous<M: Merge> {
    /// Sub-requests that have not reported yet.
    outstanding: usize,
    /// Running merge; taken by the last completion.
    acc: Option<M>,
    done: Option<oneshot::Sender<M::Output>>,
}

/// Per-operation scratch shared by the sub-requests of one dispatch.
///
/// Every sub-request folds its result into the same accumulator under one lock, so the
/// merge sees completions one at a time and exactly one of them delivers the output.
pub struct OpContext<M: Merge> {
    state: Mutex<Rendezvous<M>>,
}

impl<M: Merge> OpContext<M> {
    fn new(outstanding: usize, merge: M, done: oneshot::Sender<M::Output>) -> Self {
        Self {
            state: Mutex::new(Rendezvous {
                outstanding,
                acc: Some(merge),
                done: Some(done),
            }),
        }
    }

    /// Folds one sub-request's result. The last completion delivers the final result.
    async fn complete(&self, subvol: &SubvolId, result: FopResult<Reply>) {
        let mut state = self.state.lock().await;

        if let Some(acc) = state.acc.as_mut() {
            acc.fold(subvol, result);
        }
        state.outstanding = state.outstanding.saturating_sub(1);

        if state.outstanding == 0
            && let (Some(acc), Some(done)) = (state.acc.take(), state.done.take())
        {
            // The caller may have stopped waiting; the result is simply dropped then.
            let _ = done.send(acc.finish());
        }
    }
}

/// The caller's end of a dispatch.
pub struct DispatchHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> DispatchHandle<T> {
    /// Waits for every sub-request and returns the merged result.
    pub async fn wait(self) -> FopResult<T> {
        self.rx.await.map_err(|_| {
            tracing::error!("Dispatch finished without a result");
            Errno::EIO
        })
    }
}

/// Sends the same operation to every target.
pub fn dispatch<M: Merge>(
    transport: &Arc<dyn Transport>,
    targets: &[SubvolId],
    fop: &Fop,
    merge: M,
) -> DispatchHandle<M::Output> {
    dispatch_each(
        transport,
        targets.iter().map(|t| (t.clone(), fop.clone())).collect(),
        merge,
    )
}

/// Sends a per-target operation to each target.
pub fn dispatch_each<M: Merge>(
    transport: &Arc<dyn Transport>,
    requests: Vec<(SubvolId, Fop)>,
    merge: M,
) -> DispatchHandle<M::Output> {
    let (tx, rx) = oneshot::channel();

    if requests.is_empty() {
        let _ = tx.send(merge.finish());
        return DispatchHandle { rx };
    }

    let ctx = Arc::new(OpContext::new(requests.len(), merge, tx));
    for (target, fop) in requests {
        let ctx = ctx.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let name = fop.name();
            let result = transport.submit(&target, fop).await;
            if let Err(errno) = &result {
                tracing::debug!("{} on {} failed: {}", name, target, errno);
            }
            ctx.complete(&target, result).await;
        });
    }

    DispatchHandle { rx }
}
