//! Caller-side multiplexer.
//!
//! One [`RpcCaller`] owns one transport. Every call opens a fresh channel;
//! streamed arguments each get a channel of their own, allocated from the
//! same counter, and are relayed by a per-argument forwarding task. A single
//! writer task drains the outbound queue so wire order matches enqueue order,
//! and a single reader task demultiplexes everything inbound by channel id.
//! Inbound messages for channels we no longer know are dropped silently;
//! teardown races are expected, not errors.

use std::collections::{BTreeMap, HashMap};
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Weak};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::error::RpcError;
use crate::message::{ChannelId, Envelope, Message, RemoteError, Value};
use crate::multicast::{Multicast, Subscription};
use crate::registry::{CallArg, ValueStream};
use crate::transport::Transport;
use crate::wire::{WireFormat, default_format};

struct CallerState {
    /// Open call channels awaiting settlement.
    call_channels: HashMap<ChannelId, Multicast<Value>>,
    /// Forwarding tasks for streamed arguments, by their channel id.
    out_relays: HashMap<ChannelId, AbortHandle>,
    /// Next channel id; shared between call and argument channels.
    next_channel: ChannelId,
    destroyed: bool,
}

struct CallerInner {
    state: Mutex<CallerState>,
    outbound: mpsc::UnboundedSender<Envelope>,
    format: Arc<dyn WireFormat>,
    tasks: Mutex<Vec<AbortHandle>>,
    shutdown_transport: Box<dyn Fn() + Send + Sync>,
}

impl Drop for CallerInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        (self.shutdown_transport)();
    }
}

/// Caller endpoint. Cloning shares the endpoint.
#[derive(Clone)]
pub struct RpcCaller {
    inner: Arc<CallerInner>,
}

impl RpcCaller {
    /// Bind to a transport with the passthrough wire format.
    ///
    /// Spawns the writer and reader tasks; must run inside a tokio runtime.
    pub fn bind<T: Transport>(transport: T) -> Self {
        Self::bind_with_format(transport, default_format())
    }

    /// Bind to a transport with an explicit wire format.
    pub fn bind_with_format<T: Transport>(transport: T, format: Arc<dyn WireFormat>) -> Self {
        let transport = Arc::new(transport);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(CallerInner {
            state: Mutex::new(CallerState {
                call_channels: HashMap::new(),
                out_relays: HashMap::new(),
                next_channel: 0,
                destroyed: false,
            }),
            outbound,
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

    /// Invoke `method` on the peer.
    ///
    /// Enqueues the `CALL` synchronously; wire order across calls matches
    /// call order. After [`destroy`](Self::destroy) the returned handle is
    /// already failed and nothing touches the transport.
    pub fn call(&self, method: impl Into<String>, args: Vec<CallArg>) -> CallHandle {
        let method = method.into();
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.destroyed {
            return failed_handle(RpcError::Destroyed);
        }

        // Streamed arguments leave a placeholder in the argument vector and
        // announce their channel id by position.
        let mut wire_args = Vec::with_capacity(args.len());
        let mut stream_args: BTreeMap<usize, ChannelId> = BTreeMap::new();
        let mut relays = Vec::new();
        for (pos, arg) in args.into_iter().enumerate() {
            match arg {
                CallArg::Value(value) => wire_args.push(value),
                CallArg::Stream(stream) => {
                    let id = state.next_channel;
                    state.next_channel += 1;
                    stream_args.insert(pos, id);
                    relays.push((id, stream));
                    wire_args.push(Value::Null);
                }
            }
        }

        let (wire_args, movables) = inner.format.to_wire(wire_args);

        let channel_id = state.next_channel;
        state.next_channel += 1;

        let chan = Multicast::with_close({
            let inner = Arc::downgrade(inner);
            move || {
                let Some(inner) = inner.upgrade() else { return };
                let _ = inner
                    .outbound
                    .send(Envelope::new(Message::Close { channel_id }));
                inner.state.lock().call_channels.remove(&channel_id);
            }
        });
        let primary = chan.subscribe();
        state.call_channels.insert(channel_id, chan.clone());

        let call = Message::Call {
            channel_id,
            method,
            args: wire_args,
            stream_args: (!stream_args.is_empty()).then_some(stream_args),
        };
        if inner
            .outbound
            .send(Envelope::with_movables(call, movables))
            .is_err()
        {
            // Writer is gone; the transport will never carry this call.
            state.call_channels.remove(&channel_id);
            chan.error(RpcError::Destroyed);
            return CallHandle {
                channel_id,
                chan,
                primary,
            };
        }

        // Relays are registered under the same lock so a racing CLOSE from
        // the peer always finds them.
        for (id, stream) in relays {
            let relay = tokio::spawn(run_out_relay(id, stream, Arc::downgrade(inner)));
            state.out_relays.insert(id, relay.abort_handle());
        }

        CallHandle {
            channel_id,
            chan,
            primary,
        }
    }

    /// Tear the endpoint down.
    ///
    /// Every pending call handle is failed with [`RpcError::Destroyed`]
    /// before this returns; argument relays are aborted and the transport is
    /// closed. Idempotent. Calls made afterwards fail locally.
    pub fn destroy(&self) {
        let (sinks, relays) = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            (
                state.call_channels.drain().collect::<Vec<_>>(),
                state.out_relays.drain().collect::<Vec<_>>(),
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

fn failed_handle(err: RpcError) -> CallHandle {
    let chan = Multicast::new();
    let primary = chan.subscribe();
    chan.error(err);
    CallHandle {
        channel_id: ChannelId::MAX,
        chan,
        primary,
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

async fn recv_loop<T: Transport>(transport: Arc<T>, inner: Weak<CallerInner>) {
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

fn handle_inbound(inner: &Arc<CallerInner>, message: Message) {
    match message {
        Message::Close { channel_id } => {
            // The peer lost interest in one of our argument streams.
            let relay = inner.state.lock().out_relays.remove(&channel_id);
            if let Some(relay) = relay {
                relay.abort();
            }
        }
        Message::Resolve { channel_id, data } => {
            let Some(sink) = inner.state.lock().call_channels.remove(&channel_id) else {
                trace!(channel_id, "RESOLVE for unknown channel, dropping");
                return;
            };
            let (_, value) = inner.format.from_wire(None, Some(data));
            sink.next(value.unwrap_or(Value::Null));
            sink.complete();
        }
        Message::Next { channel_id, data } => {
            let sink = inner.state.lock().call_channels.get(&channel_id).cloned();
            let Some(sink) = sink else {
                trace!(channel_id, "NEXT for unknown channel, dropping");
                return;
            };
            let (_, value) = inner.format.from_wire(None, Some(data));
            sink.next(value.unwrap_or(Value::Null));
        }
        Message::Error { channel_id, data } => {
            let Some(sink) = inner.state.lock().call_channels.remove(&channel_id) else {
                trace!(channel_id, "ERROR for unknown channel, dropping");
                return;
            };
            let (error, _) = inner.format.from_wire(Some(data), None);
            sink.error(error.unwrap_or_else(|| {
                RpcError::Remote(RemoteError::new("unspecified remote error"))
            }));
        }
        Message::Complete { channel_id } => {
            let Some(sink) = inner.state.lock().call_channels.remove(&channel_id) else {
                trace!(channel_id, "COMPLETE for unknown channel, dropping");
                return;
            };
            sink.complete();
        }
        other => {
            debug!(kind = other.kind(), "message has no caller-side meaning, dropping");
        }
    }
}

/// Forward one streamed argument to the peer, value by value.
async fn run_out_relay(channel_id: ChannelId, mut stream: ValueStream, inner: Weak<CallerInner>) {
    loop {
        let item = stream.next().await;
        let Some(inner) = inner.upgrade() else { return };
        match item {
            Some(Ok(value)) => {
                // Each streamed value goes through the wire format on its
                // own, exactly like a one-element argument vector.
                let (mut args, movables) = inner.format.to_wire(vec![value]);
                let data = args.pop().unwrap_or(Value::Null);
                let next = Message::Next { channel_id, data };
                if inner
                    .outbound
                    .send(Envelope::with_movables(next, movables))
                    .is_err()
                {
                    return;
                }
            }
            Some(Err(err)) => {
                let _ = inner.outbound.send(Envelope::new(Message::Error {
                    channel_id,
                    data: err.to_remote(),
                }));
                inner.state.lock().out_relays.remove(&channel_id);
                return;
            }
            None => {
                let _ = inner
                    .outbound
                    .send(Envelope::new(Message::Complete { channel_id }));
                inner.state.lock().out_relays.remove(&channel_id);
                return;
            }
        }
    }
}

/// The result of one call.
///
/// Await it for the single-value form: it drains the channel and yields the
/// last value before completion, or the error that terminated it.
/// [`first`](Self::first) yields the first value instead, and
/// [`subscribe`](Self::subscribe) attaches extra consumers to the full
/// stream. When the last consumer detaches, `CLOSE` is sent to the peer.
pub struct CallHandle {
    channel_id: ChannelId,
    chan: Multicast<Value>,
    primary: Subscription<Value>,
}

impl CallHandle {
    /// The call's channel id, unique within this endpoint.
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// The first value produced by the call.
    pub async fn first(self) -> Result<Value, RpcError> {
        let mut primary = self.primary;
        match primary.next().await {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(err),
            None => Ok(Value::Null),
        }
    }

    /// An additional consumer of the result stream. Sees values emitted from
    /// now on; there is no replay.
    pub fn subscribe(&self) -> Subscription<Value> {
        self.chan.subscribe()
    }

    /// The primary subscription, buffering since the call was made.
    pub fn into_subscription(self) -> Subscription<Value> {
        self.primary
    }
}

impl IntoFuture for CallHandle {
    type Output = Result<Value, RpcError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        let mut primary = self.primary;
        Box::pin(async move {
            let mut last = None;
            while let Some(item) = primary.next().await {
                match item {
                    Ok(value) => last = Some(value),
                    Err(err) => return Err(err),
                }
            }
            Ok(last.unwrap_or(Value::Null))
        })
    }
}
