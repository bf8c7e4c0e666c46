//! Message ports: the untyped channel an [`RpcTransport`](super::RpcTransport)
//! rides on, plus the origin policy for what it accepts.

use super::RpcError;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound half of a message channel. Posting never waits for the peer.
pub trait MessagePort: Send + Sync {
    fn post(&self, data: Value) -> Result<(), RpcError>;
}

/// A message as received, tagged with the origin of whoever posted it.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub origin: String,
    pub data: Value,
}

/// Posts into an in-process inbox, stamping every message with this side's origin.
pub struct LocalPort {
    origin: String,
    peer: mpsc::UnboundedSender<InboundMessage>,
}

impl MessagePort for LocalPort {
    fn post(&self, data: Value) -> Result<(), RpcError> {
        self.peer
            .send(InboundMessage {
                origin: self.origin.clone(),
                data,
            })
            .map_err(|_| RpcError::Transport("peer is gone".to_string()))
    }
}

/// One side of a connected pair: where to post, and where the peer's posts land.
pub struct PortEnd {
    pub port: Arc<dyn MessagePort>,
    pub inbox: mpsc::UnboundedReceiver<InboundMessage>,
}

/// Two connected ends. Messages posted from `a` arrive in `b.inbox` with origin
/// `origin_a`, and the other way round.
pub fn local_pair(origin_a: &str, origin_b: &str) -> (PortEnd, PortEnd) {
    let (to_b, b_inbox) = mpsc::unbounded_channel();
    let (to_a, a_inbox) = mpsc::unbounded_channel();
    let a = PortEnd {
        port: Arc::new(LocalPort {
            origin: origin_a.to_string(),
            peer: to_b,
        }),
        inbox: a_inbox,
    };
    let b = PortEnd {
        port: Arc::new(LocalPort {
            origin: origin_b.to_string(),
            peer: to_a,
        }),
        inbox: b_inbox,
    };
    (a, b)
}

/// Which origins a transport accepts messages from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OriginMatcher {
    #[default]
    Any,
    Exact(String),
    OneOf(Vec<String>),
}

impl OriginMatcher {
    /// `"*"` accepts everything; a comma-separated list accepts any of its entries.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" || raw.is_empty() {
            return Self::Any;
        }
        let origins: Vec<String> = raw
            .split(',')
            .map(|o| o.trim().trim_end_matches('/').to_string())
            .filter(|o| !o.is_empty())
            .collect();
        match origins.as_slice() {
            [single] => Self::Exact(single.clone()),
            _ => Self::OneOf(origins),
        }
    }

    pub fn matches(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/');
        match self {
            Self::Any => true,
            Self::Exact(allowed) => allowed == origin,
            Self::OneOf(allowed) => allowed.iter().any(|a| a == origin),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn origin_matcher_parsing() {
        assert_eq!(OriginMatcher::parse("*"), OriginMatcher::Any);
        assert_eq!(
            OriginMatcher::parse("https://a.test/"),
            OriginMatcher::Exact("https://a.test".into())
        );
        let many = OriginMatcher::parse("https://a.test, https://b.test");
        assert!(many.matches("https://b.test"));
        assert!(!many.matches("https://c.test"));
        assert!(OriginMatcher::Any.matches("null"));
    }

    #[tokio::test]
    async fn pair_delivers_with_sender_origin() {
        let (a, mut b) = local_pair("https://host.test", "https://preview.test");
        a.port.post(json!({"hello": 1})).unwrap();
        let got = b.inbox.recv().await.unwrap();
        assert_eq!(got.origin, "https://host.test");
        assert_eq!(got.data, json!({"hello": 1}));

        drop(b);
        assert!(matches!(
            a.port.post(json!(null)),
            Err(RpcError::Transport(_))
        ));
    }
}
