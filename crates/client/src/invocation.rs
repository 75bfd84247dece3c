//! Correlation of outstanding invocations with their completions.

use std::collections::HashMap;

use hubline_protocol::{CompletionMessage, CompletionOutcome};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use crate::ClientError;

pub(crate) type Completion = Result<Value, ClientError>;

#[derive(Default)]
struct Table {
    /// Refuses new registrations while no session is running.
    open: bool,
    next_id: u64,
    waiting: HashMap<String, oneshot::Sender<Completion>>,
}

/// Invocations waiting for a completion, keyed by invocation id.
#[derive(Default)]
pub(crate) struct PendingInvocations {
    table: Mutex<Table>,
}

impl PendingInvocations {
    pub(crate) fn open(&self) {
        self.table.lock().open = true;
    }

    /// Allocates the next invocation id and its completion slot.
    pub(crate) fn register(&self) -> Result<(String, oneshot::Receiver<Completion>), ClientError> {
        let mut table = self.table.lock();
        if !table.open {
            return Err(ClientError::Cancelled);
        }
        table.next_id += 1;
        let id = table.next_id.to_string();
        let (tx, rx) = oneshot::channel();
        table.waiting.insert(id.clone(), tx);
        Ok((id, rx))
    }

    pub(crate) fn remove(&self, id: &str) {
        self.table.lock().waiting.remove(id);
    }

    /// Routes a completion to its caller. Unknown ids are logged and dropped.
    pub(crate) fn complete(&self, completion: CompletionMessage) {
        let Some(tx) = self.table.lock().waiting.remove(&completion.invocation_id) else {
            warn!(
                invocation_id = %completion.invocation_id,
                "completion for unknown invocation"
            );
            return;
        };
        let outcome = match completion.outcome {
            CompletionOutcome::Void => Ok(Value::Null),
            CompletionOutcome::Result(value) => Ok(value),
            CompletionOutcome::Error(error) => Err(ClientError::Invocation(error)),
        };
        let _ = tx.send(outcome);
    }

    /// Fails every waiting invocation with [`ClientError::Cancelled`] and
    /// refuses new ones until [`open`](Self::open) is called again.
    pub(crate) fn cancel_all(&self) -> usize {
        let waiting = {
            let mut table = self.table.lock();
            table.open = false;
            std::mem::take(&mut table.waiting)
        };
        let count = waiting.len();
        for (_, tx) in waiting {
            let _ = tx.send(Err(ClientError::Cancelled));
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table.lock().waiting.len()
    }
}
