//! Session registry: which service is connected, over which stream.
//!
//! One live session per service name. Registering a second session for the
//! same name replaces the first and fires its cancellation token, so the
//! superseded receive handler unwinds on its next tick.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use uuid::Uuid;

use courier_error::{BrokerError, BrokerResult};

use crate::proto::broker::v1::Message;

/// Handle to one live receive stream.
#[derive(Clone)]
pub struct SessionHandle {
    service: String,
    session_id: Uuid,
    sender: mpsc::Sender<Result<Message, Status>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(service: String, sender: mpsc::Sender<Result<Message, Status>>) -> Self {
        Self {
            service,
            session_id: Uuid::new_v4(),
            sender,
            cancel: CancellationToken::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Generation marker distinguishing this session from a replacement.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Token fired when this session is replaced or torn down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Push a message onto the stream. Fails when the client is gone.
    pub async fn push(&self, msg: Message) -> BrokerResult<()> {
        self.sender
            .send(Ok(msg))
            .await
            .map_err(|_| BrokerError::stream("receive stream closed"))
    }
}

/// Concurrent map from service name to its active session.
///
/// Many readers (the router's lookups), few writers (receive handlers
/// registering and unregistering).
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session, replacing and cancelling any prior one for the
    /// same service name.
    pub fn register(&self, handle: SessionHandle) {
        let replaced = self
            .sessions
            .write()
            .insert(handle.service().to_string(), handle);
        if let Some(prior) = replaced {
            tracing::debug!(service = %prior.service(), "replacing existing session");
            prior.cancel.cancel();
        }
    }

    /// Look up the live session for `service`, if any.
    pub fn lookup(&self, service: &str) -> Option<SessionHandle> {
        self.sessions.read().get(service).cloned()
    }

    /// Remove the session for `service`, but only the given generation: a
    /// superseded handler must not evict its replacement.
    pub fn unregister(&self, service: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(service) {
            Some(current) if current.session_id == session_id => {
                sessions.remove(service);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
