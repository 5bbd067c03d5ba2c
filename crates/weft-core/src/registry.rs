//! Method table for the callee side.
//!
//! Every callable method is registered by name before the adapter binds;
//! there is no runtime discovery. A handler receives its arguments as
//! [`CallArg`]s (plain values or live argument streams) and answers with a
//! [`Reply`] that is either a single value or a stream.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_core::future::BoxFuture;
use futures_core::stream::BoxStream;

use crate::error::{RegistryError, RpcError};
use crate::message::Value;

/// A stream of payload values, as supplied for a streamed call argument or
/// produced by a streaming handler.
pub type ValueStream = BoxStream<'static, Result<Value, RpcError>>;

/// One call argument: either a plain value or a live stream of values.
pub enum CallArg {
    Value(Value),
    Stream(ValueStream),
}

impl CallArg {
    pub fn into_value(self) -> Option<Value> {
        match self {
            CallArg::Value(v) => Some(v),
            CallArg::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<ValueStream> {
        match self {
            CallArg::Stream(s) => Some(s),
            CallArg::Value(_) => None,
        }
    }
}

impl From<Value> for CallArg {
    fn from(v: Value) -> Self {
        CallArg::Value(v)
    }
}

/// What a handler answers with.
///
/// `Value` settles the call channel with a single `RESOLVE`; `Stream` relays
/// every item as `NEXT` and finishes with `COMPLETE` or `ERROR`.
pub enum Reply {
    Value(Value),
    Stream(ValueStream),
}

impl From<Value> for Reply {
    fn from(v: Value) -> Self {
        Reply::Value(v)
    }
}

/// An async method implementation.
pub trait MethodHandler: Send + Sync {
    fn invoke(&self, args: Vec<CallArg>) -> BoxFuture<'static, Result<Reply, RpcError>>;
}

struct FnHandler<F>(F);

impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Vec<CallArg>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Reply, RpcError>> + Send + 'static,
{
    fn invoke(&self, args: Vec<CallArg>) -> BoxFuture<'static, Result<Reply, RpcError>> {
        Box::pin((self.0)(args))
    }
}

/// Name → handler table consulted for every inbound `CALL`.
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure-based handler. Duplicate names are rejected.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Vec<CallArg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, RpcError>> + Send + 'static,
    {
        self.register_arc(name, Arc::new(FnHandler(handler)))
    }

    /// Register a pre-built handler. Duplicate names are rejected.
    pub fn register_arc(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::DuplicateMethod(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry
            .register("ping", |_args| async { Ok(Reply::Value(Value::Null)) })
            .unwrap();
        registry
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = sample_registry();
        let err = registry
            .register("ping", |_args| async { Ok(Reply::Value(Value::Null)) })
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateMethod("ping".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_misses_return_none() {
        let registry = sample_registry();
        assert!(registry.get("ping").is_some());
        assert!(registry.get("pong").is_none());
        assert!(!registry.contains("pong"));
    }

    #[tokio::test]
    async fn handlers_receive_their_arguments() {
        let mut registry = ServiceRegistry::new();
        registry
            .register("double", |args: Vec<CallArg>| async move {
                let n = args
                    .into_iter()
                    .next()
                    .and_then(CallArg::into_value)
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                Ok(Reply::Value(Value::Int(n * 2)))
            })
            .unwrap();

        let handler = registry.get("double").unwrap();
        let reply = handler
            .invoke(vec![Value::Int(21).into()])
            .await
            .unwrap();
        let Reply::Value(value) = reply else {
            panic!("expected a value reply");
        };
        assert_eq!(value, Value::Int(42));
    }
}
