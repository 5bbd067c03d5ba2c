//! Shared fixtures for weft tests: a demo service registry, a recording
//! transport wrapper, and helpers that wire a caller and an adapter together
//! over an in-memory pair.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;

use weft_core::{
    CallArg, Envelope, MemTransport, Reply, RemoteError, RpcCaller, RpcError, ServiceAdapter,
    ServiceRegistry, Transport, TransportError, Value, WireFormat,
};

/// A registry with one method of every interesting shape:
///
/// - `echo` resolves with its first argument
/// - `count` streams `1..=n` for an integer argument `n`
/// - `fail` errors with message `boom` and a stack
/// - `sum` drains a streamed integer argument and resolves with the total
/// - `ignore_stream` drops its streamed argument unconsumed and resolves
/// - `never` never settles
/// - `ticks` streams one value and then never ends
pub fn demo_registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();

    registry
        .register("echo", |args: Vec<CallArg>| async move {
            let first = args
                .into_iter()
                .next()
                .and_then(CallArg::into_value)
                .unwrap_or(Value::Null);
            Ok(Reply::Value(first))
        })
        .expect("echo");

    registry
        .register("count", |args: Vec<CallArg>| async move {
            let n = args
                .into_iter()
                .next()
                .and_then(CallArg::into_value)
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let items = tokio_stream::iter((1..=n).map(|i| Ok(Value::Int(i))));
            Ok(Reply::Stream(items.boxed()))
        })
        .expect("count");

    registry
        .register("fail", |_args| async {
            Err(RpcError::Remote(RemoteError::with_stack(
                "boom",
                "demo_registry::fail",
            )))
        })
        .expect("fail");

    registry
        .register("sum", |args: Vec<CallArg>| async move {
            let Some(mut values) = args.into_iter().next().and_then(CallArg::into_stream) else {
                return Ok(Reply::Value(Value::Int(0)));
            };
            let mut total = 0;
            while let Some(item) = values.next().await {
                total += item?.as_i64().unwrap_or(0);
            }
            Ok(Reply::Value(Value::Int(total)))
        })
        .expect("sum");

    registry
        .register("ignore_stream", |args: Vec<CallArg>| async move {
            drop(args);
            Ok(Reply::Value(Value::Null))
        })
        .expect("ignore_stream");

    registry
        .register("never", |_args| async {
            std::future::pending::<Result<Reply, RpcError>>().await
        })
        .expect("never");

    registry
        .register("ticks", |_args| async {
            let first = stream::once(async { Ok(Value::Int(0)) });
            let rest = stream::pending::<Result<Value, RpcError>>();
            Ok(Reply::Stream(first.chain(rest).boxed()))
        })
        .expect("ticks");

    registry
}

/// Recorded wire traffic of one [`SpyTransport`]. Clonable; both directions
/// snapshot independently.
#[derive(Clone, Default)]
pub struct SpyLog {
    sent: Arc<Mutex<Vec<Envelope>>>,
    received: Arc<Mutex<Vec<Envelope>>>,
}

impl SpyLog {
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.received.lock().clone()
    }

    /// How many sent messages are of the given kind (`"CALL"`, `"CLOSE"`...).
    pub fn sent_of_kind(&self, kind: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|env| env.message.kind() == kind)
            .count()
    }
}

/// Wraps any transport and records every envelope that crosses it.
pub struct SpyTransport<T> {
    inner: T,
    log: SpyLog,
}

impl<T: Transport> SpyTransport<T> {
    pub fn new(inner: T) -> (Self, SpyLog) {
        let log = SpyLog::default();
        (
            Self {
                inner,
                log: log.clone(),
            },
            log,
        )
    }
}

impl<T: Transport> Transport for SpyTransport<T> {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.log.sent.lock().push(envelope.clone());
        self.inner.send(envelope).await
    }

    async fn recv(&self) -> Result<Envelope, TransportError> {
        let envelope = self.inner.recv().await?;
        self.log.received.lock().push(envelope.clone());
        Ok(envelope)
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Caller and adapter joined over an in-memory pair.
pub fn connected_pair(registry: ServiceRegistry) -> (RpcCaller, ServiceAdapter) {
    let (a, b) = MemTransport::pair();
    (RpcCaller::bind(a), ServiceAdapter::bind(b, registry))
}

/// Like [`connected_pair`], with both transports spied on.
pub fn spied_pair(registry: ServiceRegistry) -> (RpcCaller, ServiceAdapter, SpyLog, SpyLog) {
    let (a, b) = MemTransport::pair();
    let (caller_transport, caller_log) = SpyTransport::new(a);
    let (adapter_transport, adapter_log) = SpyTransport::new(b);
    (
        RpcCaller::bind(caller_transport),
        ServiceAdapter::bind(adapter_transport, registry),
        caller_log,
        adapter_log,
    )
}

/// Like [`spied_pair`], with an explicit wire format on the caller side.
pub fn spied_pair_with_format(
    registry: ServiceRegistry,
    format: Arc<dyn WireFormat>,
) -> (RpcCaller, ServiceAdapter, SpyLog, SpyLog) {
    let (a, b) = MemTransport::pair();
    let (caller_transport, caller_log) = SpyTransport::new(a);
    let (adapter_transport, adapter_log) = SpyTransport::new(b);
    (
        RpcCaller::bind_with_format(caller_transport, format),
        ServiceAdapter::bind(adapter_transport, registry),
        caller_log,
        adapter_log,
    )
}

/// Poll `cond` until it holds, panicking after roughly a second. For
/// assertions about traffic that arrives asynchronously (CLOSE on
/// unsubscribe, relay teardown).
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
