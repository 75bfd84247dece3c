use serde_json::Value;

/// A message exchanged after the handshake.
///
/// Push messages are invocations without an invocation id travelling from
/// server to client.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(InvocationMessage),
    Completion(CompletionMessage),
    Ping,
    Close(CloseMessage),
    /// A recognised message kind this implementation does not act on
    /// (stream items, acks, sequence messages...). Receivers ignore it.
    Other { kind: u64 },
}

/// A named call carrying its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationMessage {
    /// Present iff the caller expects a completion.
    pub invocation_id: Option<String>,
    pub target: String,
    pub arguments: Vec<Value>,
}

impl InvocationMessage {
    /// Builds an invocation that expects a completion.
    pub fn call(id: impl Into<String>, target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            invocation_id: Some(id.into()),
            target: target.into(),
            arguments,
        }
    }

    /// Builds a fire-and-forget invocation (client send, or server push).
    pub fn notify(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }
}

/// The single response to an invocation carrying an id.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    pub invocation_id: String,
    pub outcome: CompletionOutcome,
}

/// What an invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// The method returned nothing.
    Void,
    Result(Value),
    Error(String),
}

impl CompletionMessage {
    pub fn with_result(invocation_id: impl Into<String>, value: Value) -> Self {
        let outcome = if value.is_null() {
            CompletionOutcome::Void
        } else {
            CompletionOutcome::Result(value)
        };
        Self {
            invocation_id: invocation_id.into(),
            outcome,
        }
    }

    pub fn with_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Error(error.into()),
        }
    }

    /// Collapses the outcome into a `Result`, mapping void to `null`.
    pub fn into_result(self) -> Result<Value, String> {
        match self.outcome {
            CompletionOutcome::Void => Ok(Value::Null),
            CompletionOutcome::Result(v) => Ok(v),
            CompletionOutcome::Error(e) => Err(e),
        }
    }
}

/// Graceful termination, sent by either side.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CloseMessage {
    pub error: Option<String>,
    /// Whether the receiving client may try to reconnect.
    pub allow_reconnect: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_result_becomes_void() {
        let c = CompletionMessage::with_result("1", Value::Null);
        assert_eq!(c.outcome, CompletionOutcome::Void);
        assert_eq!(c.into_result(), Ok(Value::Null));
    }

    #[test]
    fn error_completion_into_result() {
        let c = CompletionMessage::with_error("2", "boom");
        assert_eq!(c.into_result(), Err("boom".to_string()));
    }

    #[test]
    fn notify_has_no_id() {
        let m = InvocationMessage::notify("Receive", vec![Value::from("hello")]);
        assert!(m.invocation_id.is_none());
        let m = InvocationMessage::call("3", "Hi", vec![]);
        assert_eq!(m.invocation_id.as_deref(), Some("3"));
    }
}
