//! Invocation handlers and the context passed to them.
//!
//! Handlers are registered with a typed signature and erased into a
//! [`HandlerDescriptor`] that records the method name and expected argument
//! count, so mismatches are reported before the handler runs.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hubline_protocol::{FromArguments, IntoArguments};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::ServerError;
use crate::clients::Target;
use crate::server::HubServer;

/// A boxed future returned by an erased handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

type ErasedHandler = dyn Fn(HubContext, Vec<Value>) -> HandlerFuture + Send + Sync;

/// A registered hub method.
pub(crate) struct HandlerDescriptor {
    pub name: String,
    /// Expected argument count; `None` accepts any.
    pub arity: Option<usize>,
    call: Box<ErasedHandler>,
}

impl HandlerDescriptor {
    pub(crate) fn new<A, R, E, F, Fut>(name: &str, handler: F) -> Self
    where
        A: FromArguments + Send + 'static,
        R: Serialize + 'static,
        E: Display + 'static,
        F: Fn(HubContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let call = move |ctx: HubContext, args: Vec<Value>| -> HandlerFuture {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let args = A::from_arguments(args).map_err(|e| e.to_string())?;
                let value = handler(ctx, args).await.map_err(|e| e.to_string())?;
                serde_json::to_value(value).map_err(|e| e.to_string())
            })
        };
        Self {
            name: name.to_string(),
            arity: A::ARITY,
            call: Box::new(call),
        }
    }

    pub(crate) fn call(&self, ctx: HubContext, args: Vec<Value>) -> HandlerFuture {
        (self.call)(ctx, args)
    }
}

/// Method table keyed by lowercased name.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<HandlerDescriptor>>>,
}

impl HandlerRegistry {
    /// Registers a handler, replacing any prior one with the same name.
    pub(crate) fn insert(&self, descriptor: HandlerDescriptor) -> Result<(), ServerError> {
        validate_method_name(&descriptor.name)?;
        let key = descriptor.name.to_lowercase();
        if let Some(prev) = self.handlers.write().insert(key, Arc::new(descriptor)) {
            tracing::debug!(method = %prev.name, "replaced hub method");
        }
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<HandlerDescriptor>> {
        self.handlers.read().get(&name.to_lowercase()).cloned()
    }
}

fn validate_method_name(name: &str) -> Result<(), ServerError> {
    if name.is_empty() {
        return Err(ServerError::Configuration(
            "hub method name must not be empty".into(),
        ));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ServerError::Configuration(format!(
            "invalid hub method name '{name}'"
        )));
    }
    Ok(())
}

/// The caller's view of the hub, handed to every invocation.
#[derive(Clone)]
pub struct HubContext {
    connection_id: String,
    server: Arc<HubServer>,
}

impl HubContext {
    pub(crate) fn new(connection_id: String, server: Arc<HubServer>) -> Self {
        Self {
            connection_id,
            server,
        }
    }

    /// Id of the connection that made the invocation.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Pushes a message to `target`. See [`HubServer::push`].
    pub fn push(
        &self,
        method: &str,
        args: impl IntoArguments,
        target: Target,
    ) -> Result<(), ServerError> {
        self.server.push(method, args, target)
    }

    /// Pushes a message back to the calling connection only.
    pub fn reply(&self, method: &str, args: impl IntoArguments) -> Result<(), ServerError> {
        self.server
            .push(method, args, Target::Connection(self.connection_id.clone()))
    }

    pub fn add_to_group(&self, group: &str) -> Result<(), ServerError> {
        self.server.add_to_group(&self.connection_id, group)
    }

    pub fn remove_from_group(&self, group: &str) -> Result<(), ServerError> {
        self.server.remove_from_group(&self.connection_id, group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerConfig;
    use serde_json::json;

    fn ctx() -> HubContext {
        HubContext::new("conn-1".into(), HubServer::new(ServerConfig::default()))
    }

    #[test]
    fn rejects_bad_names() {
        assert!(validate_method_name("").is_err());
        assert!(validate_method_name("Say Hi").is_err());
        assert!(validate_method_name("Hi\n").is_err());
        assert!(validate_method_name("Hi").is_ok());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = HandlerRegistry::default();
        registry
            .insert(HandlerDescriptor::new("Hi", |_ctx, (_m,): (String,)| async {
                Ok::<_, String>(true)
            }))
            .unwrap();
        assert!(registry.get("hi").is_some());
        assert!(registry.get("HI").is_some());
        assert_eq!(registry.get("Hi").unwrap().arity, Some(1));
        assert!(registry.get("Bye").is_none());
    }

    #[test]
    fn reregistration_replaces() {
        let registry = HandlerRegistry::default();
        registry
            .insert(HandlerDescriptor::new("Echo", |_ctx, (): ()| async {
                Ok::<_, String>(1)
            }))
            .unwrap();
        registry
            .insert(HandlerDescriptor::new("echo", |_ctx, args: Vec<Value>| async move {
                Ok::<_, String>(args.len())
            }))
            .unwrap();
        assert_eq!(registry.handlers.read().len(), 1);
        assert_eq!(registry.get("ECHO").unwrap().arity, None);
    }

    #[tokio::test]
    async fn erased_call_binds_and_serializes() {
        let d = HandlerDescriptor::new("Add", |_ctx, (a, b): (i64, i64)| async move {
            Ok::<_, String>(a + b)
        });
        let out = d.call(ctx(), vec![json!(2), json!(3)]).await;
        assert_eq!(out, Ok(json!(5)));
    }

    #[tokio::test]
    async fn erased_call_reports_bind_and_handler_errors() {
        let d = HandlerDescriptor::new("Fail", |_ctx, (m,): (String,)| async move {
            Err::<(), _>(format!("bad input: {m}"))
        });
        let err = d.call(ctx(), vec![json!(1)]).await.unwrap_err();
        assert!(err.contains("argument 0"), "{err}");
        let err = d.call(ctx(), vec![json!("x")]).await.unwrap_err();
        assert_eq!(err, "bad input: x");
    }
}
