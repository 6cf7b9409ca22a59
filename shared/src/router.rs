//! Message routing: live fast path or durable spool.

use std::sync::Arc;

use prost::Message as _;
use tokio::sync::Mutex;
use tracing::{info, warn};

use courier_error::BrokerResult;

use crate::proto::broker::v1::{Error as WireError, Event, Message, Status as WireStatus};
use crate::registry::SessionRegistry;
use crate::spool::Spool;
use crate::utils;

/// Length of the random id component in spool keys.
pub const SPOOL_ID_LEN: usize = 16;

pub fn ok_status(message: impl Into<String>) -> WireStatus {
    WireStatus {
        message: message.into(),
        success: true,
        error: WireError::None as i32,
    }
}

pub fn fail_status(error: WireError, message: impl Into<String>) -> WireStatus {
    WireStatus {
        message: message.into(),
        success: false,
        error: error as i32,
    }
}

/// Routes one message: forwarded to a live session, spooled when absent and
/// queueing was requested, refused otherwise.
///
/// The lookup/forward pair runs under a best-effort acquire of the
/// server-wide mutex; contention surfaces as `Server busy` rather than
/// queueing work indefinitely.
pub struct Router {
    registry: Arc<SessionRegistry>,
    spool: Arc<Spool>,
    send_lock: Arc<Mutex<()>>,
}

impl Router {
    pub fn new(registry: Arc<SessionRegistry>, spool: Arc<Spool>, send_lock: Arc<Mutex<()>>) -> Self {
        Self {
            registry,
            spool,
            send_lock,
        }
    }

    pub async fn send(&self, msg: Message) -> WireStatus {
        if msg.data.is_empty() || msg.from.is_empty() || msg.to.is_empty() {
            return fail_status(WireError::InvalidRequest, "Invalid message");
        }
        info!(from = %msg.from, to = %msg.to, "routing message");

        let Ok(_guard) = self.send_lock.try_lock() else {
            return fail_status(WireError::ServerError, "Server busy");
        };

        if let Some(session) = self.registry.lookup(&msg.to) {
            let to = msg.to.clone();
            match session.push(msg).await {
                Ok(()) => ok_status("Message sent"),
                Err(err) => {
                    // The recipient is nominally connected; do not spool.
                    warn!(to = %to, error = %err, "failed to forward to live session");
                    fail_status(WireError::ServerError, err.to_string())
                }
            }
        } else if msg.queue {
            match self.spool_message(msg) {
                Ok(()) => ok_status("Message queued"),
                Err(err) => {
                    warn!(error = %err, "failed to store queued message");
                    fail_status(WireError::ServerError, err.to_string())
                }
            }
        } else {
            WireStatus {
                message: "Recipient not found".to_string(),
                success: false,
                error: WireError::None as i32,
            }
        }
    }

    fn spool_message(&self, msg: Message) -> BrokerResult<()> {
        let key = Spool::key_for(&msg.to, &utils::uid(SPOOL_ID_LEN));
        // seq and event are broker-assigned; sender-provided values are
        // overwritten, and the queue flag is consumed here.
        let stored = Message {
            data: msg.data,
            r#type: msg.r#type,
            queue: false,
            seq: Some(utils::now_timestamp()),
            from: msg.from,
            to: msg.to,
            event: Event::Message as i32,
            done: false,
        };
        self.spool.put(&key, &stored.encode_to_vec())?;
        info!(to = %stored.to, key = %key, "message queued");
        Ok(())
    }
}
