#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod adapter;
mod caller;
mod error;
mod message;
mod multicast;
mod proxy;
mod registry;
mod transport;
mod wire;

pub use adapter::ServiceAdapter;
pub use caller::{CallHandle, RpcCaller};
pub use error::{RegistryError, RpcError, TransportError};
pub use message::{ChannelId, Envelope, Message, PortToken, RemoteError, Value};
pub use multicast::{Multicast, Subscription};
pub use proxy::{MethodStub, ServiceProxy};
pub use registry::{CallArg, MethodHandler, Reply, ServiceRegistry, ValueStream};
pub use transport::Transport;
#[cfg(feature = "mem")]
pub use transport::mem::MemTransport;
#[cfg(feature = "proc")]
pub use transport::proc::ProcTransport;
#[cfg(feature = "stream")]
pub use transport::stream::StreamTransport;
pub use wire::{
    IdentityFormat, TRANSFER_LIST_KEY, TransferExtractFormat, WireFormat, default_format,
    extract_transfer_list,
};

// Consumers drive subscriptions and build argument streams with these.
pub use futures_util::StreamExt;
