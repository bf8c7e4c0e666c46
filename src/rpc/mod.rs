//! Call/response RPC over an untyped, fire-and-forget message channel.
//!
//! Either side of a [`port::MessagePort`] pair can register named handlers and
//! call the other side's. Every call settles: with the handler's result, with
//! [`RpcError::Remote`] if the handler failed or does not exist, or with
//! [`RpcError::Timeout`] if nothing came back in time.

pub mod envelope;
pub mod port;
pub mod preview;
pub mod transport;

pub use envelope::RpcEnvelope;
pub use port::{local_pair, InboundMessage, LocalPort, MessagePort, OriginMatcher, PortEnd};
pub use preview::{ElementInfo, PreviewBridge, Rect};
pub use transport::{method_fn, MethodHandler, RpcSettings, RpcTransport};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("RPC call `{method}` timed out after {after_ms}ms")]
    Timeout { method: String, after_ms: u64 },

    /// The peer's handler failed, or the peer has no such method.
    #[error("{0}")]
    Remote(String),

    #[error("message port: {0}")]
    Transport(String),

    #[error("unexpected RPC result: {0}")]
    Decode(String),
}
