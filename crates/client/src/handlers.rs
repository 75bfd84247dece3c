//! Push handlers registered with [`HubConnection::on`](crate::HubConnection::on).

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use hubline_protocol::{FromArguments, InvocationMessage};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{trace, warn};

use crate::ClientError;

type ErasedPush = dyn Fn(Vec<Value>) -> Result<(), ClientError> + Send + Sync;

/// Handlers keyed by lowercased method name, in registration order.
#[derive(Default)]
pub(crate) struct PushHandlers {
    handlers: RwLock<HashMap<String, Vec<Arc<ErasedPush>>>>,
}

impl PushHandlers {
    pub(crate) fn insert<A, F>(&self, method: &str, handler: F)
    where
        A: FromArguments + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        let erased = move |args: Vec<Value>| -> Result<(), ClientError> {
            handler(A::from_arguments(args)?);
            Ok(())
        };
        self.handlers
            .write()
            .entry(method.to_lowercase())
            .or_default()
            .push(Arc::new(erased));
    }

    /// Runs every handler registered for the message's target.
    ///
    /// Binding errors and panics are logged; they never reach the caller.
    pub(crate) fn dispatch(&self, message: &InvocationMessage) {
        let handlers = self
            .handlers
            .read()
            .get(&message.target.to_lowercase())
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            warn!(target = %message.target, "no handler registered for pushed method");
            return;
        }
        trace!(target = %message.target, count = handlers.len(), "dispatching push");

        for handler in handlers {
            let args = message.arguments.clone();
            match catch_unwind(AssertUnwindSafe(|| handler(args))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(target = %message.target, "push handler rejected arguments: {e}");
                }
                Err(_) => warn!(target = %message.target, "push handler panicked"),
            }
        }
    }
}
