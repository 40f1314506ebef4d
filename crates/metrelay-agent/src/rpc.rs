use std::sync::Arc;

use metrelay_proto::ProxyMessage;
use metrelay_transport::{TransportError, TransportStream};
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::AgentError;
use crate::session::SessionState;

/// Shared handle to the current session's control client, empty while
/// disconnected.
pub(crate) type ControlSlot<S> = Arc<Mutex<Option<Arc<ControlClient<S>>>>>;

/// Request/reply client over the session's control stream. Calls are
/// serialized so replies pair up with requests.
pub(crate) struct ControlClient<S: TransportStream> {
    stream: Mutex<S>,
    session: Arc<SessionState>,
}

impl<S: TransportStream> ControlClient<S> {
    pub fn new(stream: S, session: Arc<SessionState>) -> Self {
        Self {
            stream: Mutex::new(stream),
            session,
        }
    }

    /// Sends one control message and waits for its reply. An empty
    /// `agent_id` is stamped with the session identity before sending.
    pub async fn call(&self, mut message: ProxyMessage) -> Result<ProxyMessage, AgentError> {
        stamp_identity(&mut message, self.session.identity().await.as_deref());
        let mut stream = self.stream.lock().await;
        trace!(message = ?message, "control request");
        stream.send_message(&message).await?;
        match stream.recv_message().await? {
            Some(reply) => {
                trace!(reply = ?reply, "control reply");
                Ok(reply)
            }
            None => Err(AgentError::Transport(TransportError::StreamClosed)),
        }
    }
}

/// Fills in an empty `agent_id` on messages that carry one. Ids already
/// set and messages without the field pass through untouched.
/// `RegisterAgent` is deliberately not stamped, it is the message that
/// obtains the identity.
pub(crate) fn stamp_identity(message: &mut ProxyMessage, identity: Option<&str>) {
    let identity = match identity {
        Some(identity) => identity,
        None => return,
    };
    match message {
        ProxyMessage::RegisterPath { agent_id, .. }
        | ProxyMessage::UnregisterPath { agent_id, .. }
        | ProxyMessage::PathMapSize { agent_id }
        | ProxyMessage::Heartbeat { agent_id }
        | ProxyMessage::ReadRequests { agent_id }
        | ProxyMessage::WriteResponses { agent_id } => {
            if agent_id.is_empty() {
                *agent_id = identity.to_string();
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrelay_transport::memory::stream_pair;

    #[test]
    fn test_stamp_fills_empty_id() {
        let mut message = ProxyMessage::Heartbeat {
            agent_id: String::new(),
        };
        stamp_identity(&mut message, Some("agent-1"));
        assert_eq!(
            message,
            ProxyMessage::Heartbeat {
                agent_id: "agent-1".to_string()
            }
        );
    }

    #[test]
    fn test_stamp_preserves_existing_id() {
        let mut message = ProxyMessage::PathMapSize {
            agent_id: "agent-2".to_string(),
        };
        stamp_identity(&mut message, Some("agent-1"));
        assert_eq!(
            message,
            ProxyMessage::PathMapSize {
                agent_id: "agent-2".to_string()
            }
        );
    }

    #[test]
    fn test_stamp_skips_register_agent() {
        let mut message = ProxyMessage::RegisterAgent {
            agent_id: String::new(),
            agent_name: "test-agent".to_string(),
            hostname: "localhost".to_string(),
        };
        stamp_identity(&mut message, Some("agent-1"));
        match message {
            ProxyMessage::RegisterAgent { agent_id, .. } => assert!(agent_id.is_empty()),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_stamps_and_pairs_reply() {
        let (agent_side, mut proxy_side) = stream_pair();
        let session = SessionState::new();
        session.set_identity("agent-1").await;
        let client = ControlClient::new(agent_side, session);

        let responder = tokio::spawn(async move {
            match proxy_side.recv_message().await.unwrap() {
                Some(ProxyMessage::Heartbeat { agent_id }) => {
                    assert_eq!(agent_id, "agent-1");
                    proxy_side
                        .send_message(&ProxyMessage::HeartbeatAck { valid: true })
                        .await
                        .unwrap();
                }
                other => panic!("unexpected message {other:?}"),
            }
            proxy_side
        });

        let reply = client
            .call(ProxyMessage::Heartbeat {
                agent_id: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(reply, ProxyMessage::HeartbeatAck { valid: true });
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_fails_on_closed_stream() {
        let (agent_side, mut proxy_side) = stream_pair();
        let client = ControlClient::new(agent_side, SessionState::new());

        let responder = tokio::spawn(async move {
            proxy_side.recv_message().await.unwrap();
            proxy_side.close().await.unwrap();
        });

        let result = client
            .call(ProxyMessage::PathMapSize {
                agent_id: "agent-1".to_string(),
            })
            .await;
        assert!(matches!(
            result,
            Err(AgentError::Transport(TransportError::StreamClosed))
        ));
        responder.await.unwrap();
    }
}
