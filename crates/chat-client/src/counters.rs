//! Unread counter persistence off the runtime loop.
//!
//! Every operation goes through one queue, so a load always observes the
//! saves and clears issued before it. Queued saves for the same user are
//! collapsed to the newest before they reach the store.

use std::sync::Arc;

use chat_platform::{CounterStoreError, UnreadCounterStore};
use tokio::{
    sync::{mpsc, oneshot},
    task,
};
use tracing::{debug, trace, warn};

enum CounterOp {
    Save {
        user_id: String,
        total: u64,
    },
    ClearAll,
    Load {
        user_id: String,
        reply: oneshot::Sender<Result<Option<u64>, CounterStoreError>>,
    },
}

fn writer_stopped() -> CounterStoreError {
    CounterStoreError::Backend("counter writer stopped".to_owned())
}

/// Queue in front of an [`UnreadCounterStore`]; blocking I/O runs on the blocking pool.
#[derive(Clone)]
pub(crate) struct CounterWriter {
    ops: mpsc::UnboundedSender<CounterOp>,
}

impl CounterWriter {
    /// Start the writer task on the current tokio runtime.
    pub(crate) fn spawn(store: Arc<dyn UnreadCounterStore>) -> Self {
        let (ops, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(store, queue));
        Self { ops }
    }

    pub(crate) fn save(&self, user_id: &str, total: u64) {
        self.submit(CounterOp::Save {
            user_id: user_id.to_owned(),
            total,
        });
    }

    pub(crate) fn clear_all(&self) {
        self.submit(CounterOp::ClearAll);
    }

    /// Read `user_id`'s counter after every write queued so far has landed.
    pub(crate) async fn load(&self, user_id: &str) -> Result<Option<u64>, CounterStoreError> {
        let (reply, loaded) = oneshot::channel();
        self.ops
            .send(CounterOp::Load {
                user_id: user_id.to_owned(),
                reply,
            })
            .map_err(|_| writer_stopped())?;
        loaded.await.map_err(|_| writer_stopped())?
    }

    fn submit(&self, op: CounterOp) {
        if self.ops.send(op).is_err() {
            warn!("counter writer stopped; dropping counter update");
        }
    }
}

async fn write_loop(
    store: Arc<dyn UnreadCounterStore>,
    mut queue: mpsc::UnboundedReceiver<CounterOp>,
) {
    while let Some(first) = queue.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = queue.try_recv() {
            batch.push(next);
        }
        let queued = batch.len();
        let ops = coalesce(batch);
        trace!(queued, applied = ops.len(), "flushing counter operations");

        let store = store.clone();
        if let Err(err) = task::spawn_blocking(move || apply(store.as_ref(), ops)).await {
            warn!(error = %err, "counter write task failed");
        }
    }
    debug!("counter writer stopped");
}

/// Drop saves that a later save or clear makes redundant. Loads are barriers.
fn coalesce(batch: Vec<CounterOp>) -> Vec<CounterOp> {
    let mut ops: Vec<CounterOp> = Vec::with_capacity(batch.len());
    let mut floor = 0;
    for op in batch {
        match &op {
            CounterOp::Load { .. } => floor = ops.len() + 1,
            CounterOp::ClearAll => ops.truncate(floor),
            CounterOp::Save { user_id, .. } => {
                let earlier = ops[floor..].iter().position(|queued| match queued {
                    CounterOp::Save {
                        user_id: queued_user,
                        ..
                    } => queued_user == user_id,
                    _ => false,
                });
                if let Some(position) = earlier {
                    ops.remove(floor + position);
                }
            }
        }
        ops.push(op);
    }
    ops
}

fn apply(store: &dyn UnreadCounterStore, ops: Vec<CounterOp>) {
    for op in ops {
        match op {
            CounterOp::Save { user_id, total } => {
                if let Err(err) = store.save(&user_id, total) {
                    warn!(%user_id, error = %err, "failed to persist unread counter");
                }
            }
            CounterOp::ClearAll => {
                if let Err(err) = store.clear_all() {
                    warn!(error = %err, "failed to clear persisted unread counters");
                }
            }
            CounterOp::Load { user_id, reply } => {
                let _ = reply.send(store.load(&user_id));
            }
        }
    }
}
