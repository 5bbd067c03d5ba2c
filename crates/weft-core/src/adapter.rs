//! Callee-side adapter.
//!
//! Binds a [`ServiceRegistry`] to a transport. Each inbound `CALL` is
//! dispatched on its own task; streamed arguments are materialized as live
//! streams fed by `NEXT` messages on their announced channels. A value reply
//! settles the call with `RESOLVE`; a stream reply is relayed as `NEXT`
//! messages until it ends, and a `CLOSE` from the peer aborts the relay.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::error::RpcError;
use crate::message::{ChannelId, Envelope, Message, RemoteError, Value};
use crate::multicast::Multicast;
use crate::registry::{CallArg, Reply, ServiceRegistry, ValueStream};
use crate::transport::Transport;
use crate::wire::{WireFormat, default_format};

struct AdapterState {
    /// Inbound streamed-argument channels, fed by `NEXT` from the peer.
    arg_channels: HashMap<ChannelId, Multicast<Value>>,
    /// Relay tasks for streaming replies, keyed by call channel.
    reply_relays: HashMap<ChannelId, AbortHandle>,
    destroyed: bool,
}

struct AdapterInner {
    state: Mutex<AdapterState>,
    outbound: mpsc::UnboundedSender<Envelope>,
    registry: ServiceRegistry,
    format: Arc<dyn WireFormat>,
    tasks: Mutex<Vec<AbortHandle>>,
    shutdown_transport: Box<dyn Fn() + Send + Sync>,
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        (self.shutdown_transport)();
    }
}

/// Callee endpoint. Cloning shares the endpoint.
#[derive(Clone)]
pub struct ServiceAdapter {
    inner: Arc<AdapterInner>,
}

impl ServiceAdapter {
    /// Bind a registry to a transport with the passthrough wire format.
    ///
    /// Spawns the writer and reader tasks; must run inside a tokio runtime.
    pub fn bind<T: Transport>(transport: T, registry: ServiceRegistry) -> Self {
        Self::bind_with_format(transport, registry, default_format())
    }

    /// Bind with an explicit wire format.
    pub fn bind_with_format<T: Transport>(
        transport: T,
        registry: ServiceRegistry,
        format: Arc<dyn WireFormat>,
    ) -> Self {
        let transport = Arc::new(transport);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(AdapterInner {
            state: Mutex::new(AdapterState {
                arg_channels: HashMap::new(),
                reply_relays: HashMap::new(),
                destroyed: false,
            }),
            outbound,
            registry,
            format,
            tasks: Mutex::new(Vec::new()),
            shutdown_transport: {
                let transport = Arc::clone(&transport);
                Box::new(move || transport.close())
            },
        });

        let writer = tokio::spawn(write_loop(Arc::clone(&transport), outbound_rx));
        let reader = tokio::spawn(recv_loop(transport, Arc::downgrade(&inner)));
        inner
            .tasks
            .lock()
            .extend([writer.abort_handle(), reader.abort_handle()]);

        Self { inner }
    }

    /// Tear the endpoint down: fail open argument streams, abort reply
    /// relays, close the transport. Idempotent.
    pub fn destroy(&self) {
        let (sinks, relays) = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            (
                state.arg_channels.drain().collect::<Vec<_>>(),
                state.reply_relays.drain().collect::<Vec<_>>(),
            )
        };
        for (_, relay) in relays {
            relay.abort();
        }
        for (_, sink) in sinks {
            sink.error(RpcError::Destroyed);
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        (self.inner.shutdown_transport)();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }
}

async fn write_loop<T: Transport>(transport: Arc<T>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        if let Err(err) = transport.send(envelope).await {
            debug!(%err, "outbound send failed, stopping writer");
            break;
        }
    }
}

async fn recv_loop<T: Transport>(transport: Arc<T>, inner: Weak<AdapterInner>) {
    loop {
        let envelope = match transport.recv().await {
            Ok(envelope) => envelope,
            Err(err) => {
                trace!(%err, "inbound stream ended");
                break;
            }
        };
        let Some(inner) = inner.upgrade() else { break };
        handle_inbound(&inner, envelope.message);
    }
}

fn handle_inbound(inner: &Arc<AdapterInner>, message: Message) {
    match message {
        Message::Call {
            channel_id,
            method,
            args,
            stream_args,
        } => handle_call(inner, channel_id, method, args, stream_args),
        Message::Close { channel_id } => {
            // The caller lost interest in a streaming reply.
            let relay = inner.state.lock().reply_relays.remove(&channel_id);
            if let Some(relay) = relay {
                relay.abort();
            }
        }
        Message::Next { channel_id, data } => {
            let sink = inner.state.lock().arg_channels.get(&channel_id).cloned();
            let Some(sink) = sink else {
                trace!(channel_id, "NEXT for unknown channel, dropping");
                return;
            };
            let (_, value) = inner.format.from_wire(None, Some(data));
            sink.next(value.unwrap_or(Value::Null));
        }
        Message::Error { channel_id, data } => {
            let Some(sink) = inner.state.lock().arg_channels.remove(&channel_id) else {
                trace!(channel_id, "ERROR for unknown channel, dropping");
                return;
            };
            let (error, _) = inner.format.from_wire(Some(data), None);
            sink.error(error.unwrap_or_else(|| {
                RpcError::Remote(RemoteError::new("unspecified remote error"))
            }));
        }
        Message::Complete { channel_id } => {
            let Some(sink) = inner.state.lock().arg_channels.remove(&channel_id) else {
                trace!(channel_id, "COMPLETE for unknown channel, dropping");
                return;
            };
            sink.complete();
        }
        other => {
            debug!(kind = other.kind(), "message has no callee-side meaning, dropping");
        }
    }
}

/// Runs synchronously in the reader task, so the argument subscriptions
/// below exist before any later `NEXT` for them is processed.
fn handle_call(
    inner: &Arc<AdapterInner>,
    channel_id: ChannelId,
    method: String,
    args: Vec<Value>,
    stream_args: Option<BTreeMap<usize, ChannelId>>,
) {
    let mut call_args: Vec<CallArg> = args.into_iter().map(CallArg::Value).collect();

    if let Some(positions) = stream_args {
        let mut state = inner.state.lock();
        for (pos, stream_channel) in positions {
            let chan = arg_channel(&mut state, inner, stream_channel);
            match call_args.get_mut(pos) {
                Some(slot) => *slot = CallArg::Stream(Box::pin(chan.subscribe())),
                None => debug!(
                    pos,
                    channel_id, "stream argument position out of range, ignoring"
                ),
            }
        }
    }

    let Some(handler) = inner.registry.get(&method) else {
        debug!(%method, channel_id, "CALL for unregistered method");
        let _ = inner.outbound.send(Envelope::new(Message::Error {
            channel_id,
            data: RpcError::UnknownMethod(method).to_remote(),
        }));
        return;
    };

    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let result = handler.invoke(call_args).await;
        let Some(inner) = weak.upgrade() else { return };
        match result {
            Ok(Reply::Value(value)) => {
                let _ = inner
                    .outbound
                    .send(Envelope::new(Message::Resolve { channel_id, data: value }));
            }
            Ok(Reply::Stream(stream)) => {
                let weak = Arc::downgrade(&inner);
                let mut state = inner.state.lock();
                if state.destroyed {
                    return;
                }
                let relay = tokio::spawn(run_reply_relay(channel_id, stream, weak));
                state.reply_relays.insert(channel_id, relay.abort_handle());
            }
            Err(err) => {
                let _ = inner.outbound.send(Envelope::new(Message::Error {
                    channel_id,
                    data: err.to_remote(),
                }));
            }
        }
    });
}

/// Get or create the multicast channel behind one streamed argument.
/// Reused if several positions announce the same channel id.
fn arg_channel(
    state: &mut AdapterState,
    inner: &Arc<AdapterInner>,
    channel_id: ChannelId,
) -> Multicast<Value> {
    if let Some(existing) = state.arg_channels.get(&channel_id) {
        return existing.clone();
    }
    let weak = Arc::downgrade(inner);
    let chan = Multicast::with_close(move || {
        // The handler dropped its last subscription; tell the caller to stop
        // sending.
        let Some(inner) = weak.upgrade() else { return };
        let _ = inner
            .outbound
            .send(Envelope::new(Message::Close { channel_id }));
        inner.state.lock().arg_channels.remove(&channel_id);
    });
    state.arg_channels.insert(channel_id, chan.clone());
    chan
}

/// Relay a streaming reply to the caller, value by value.
async fn run_reply_relay(channel_id: ChannelId, mut stream: ValueStream, inner: Weak<AdapterInner>) {
    loop {
        let item = stream.next().await;
        let Some(inner) = inner.upgrade() else { return };
        match item {
            Some(Ok(value)) => {
                let next = Message::Next { channel_id, data: value };
                if inner.outbound.send(Envelope::new(next)).is_err() {
                    return;
                }
            }
            Some(Err(err)) => {
                let _ = inner.outbound.send(Envelope::new(Message::Error {
                    channel_id,
                    data: err.to_remote(),
                }));
                inner.state.lock().reply_relays.remove(&channel_id);
                return;
            }
            None => {
                let _ = inner
                    .outbound
                    .send(Envelope::new(Message::Complete { channel_id }));
                inner.state.lock().reply_relays.remove(&channel_id);
                return;
            }
        }
    }
}
