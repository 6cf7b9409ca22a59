//! The gRPC Broker service: Ping, Send, Receive, Cleanup.
//!
//! Receive is the long-lived half: the handler registers a session, then a
//! background task replays spooled messages and parks on a short tick,
//! watching for replacement or client disconnect, until teardown removes the
//! session again.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use prost::Message as _;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_error::{BrokerError, BrokerResult};

use crate::auth::ANONYMOUS_SERVICE;
use crate::context::AppContext;
use crate::interceptor::AuthenticatedService;
use crate::proto::broker::v1::broker_server::Broker;
use crate::proto::broker::v1::{
    Error as WireError, Event, Identity, Message, Status as WireStatus, Type,
};
use crate::registry::SessionHandle;
use crate::router::{fail_status, ok_status};
use crate::spool::Spool;
use crate::utils;

/// Sender name on synthetic messages emitted by the broker itself.
pub const BROKER_NAME: &str = "broker";

/// Channel depth for one receive stream.
const SESSION_BUFFER: usize = 64;

/// Park interval between spool drains on a live stream.
const DRAIN_TICK: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct BrokerService {
    ctx: Arc<AppContext>,
}

impl BrokerService {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Authenticated service name bound by the auth layer, if present.
    fn caller<T>(request: &Request<T>) -> Option<String> {
        request
            .extensions()
            .get::<AuthenticatedService>()
            .map(|identity| identity.0.clone())
    }

    /// Whether the authenticated caller may act as `from`.
    ///
    /// `anonymous` (auth disabled, or no auth layer installed) may act as
    /// anyone; otherwise the names must match.
    fn caller_matches(caller: &Option<String>, from: &str) -> bool {
        match caller.as_deref() {
            None | Some(ANONYMOUS_SERVICE) => true,
            Some(name) => name == from,
        }
    }
}

#[tonic::async_trait]
impl Broker for BrokerService {
    async fn ping(&self, _request: Request<Identity>) -> Result<Response<WireStatus>, Status> {
        Ok(Response::new(ok_status("Pong")))
    }

    async fn send(&self, request: Request<Message>) -> Result<Response<WireStatus>, Status> {
        let msg = request.into_inner();
        Ok(Response::new(self.ctx.router.send(msg).await))
    }

    type ReceiveStream = Pin<Box<dyn Stream<Item = Result<Message, Status>> + Send + 'static>>;

    async fn receive(
        &self,
        request: Request<Identity>,
    ) -> Result<Response<Self::ReceiveStream>, Status> {
        let caller = Self::caller(&request);
        let identity = request.into_inner();

        if identity.from.is_empty() {
            return Err(Status::invalid_argument("missing service name"));
        }
        if !Self::caller_matches(&caller, &identity.from) {
            return Err(Status::invalid_argument(
                "identity does not match authenticated service",
            ));
        }

        let service = identity.from;
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let handle = SessionHandle::new(service.clone(), tx.clone());
        let session_id = handle.session_id();
        let cancel = handle.cancel_token();
        self.ctx.registry.register(handle);
        info!(service = %service, "client connected");

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            receive_loop(ctx, service, session_id, tx, cancel).await;
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::ReceiveStream
        ))
    }

    async fn cleanup(&self, request: Request<Identity>) -> Result<Response<WireStatus>, Status> {
        let caller = Self::caller(&request);
        let identity = request.into_inner();

        if identity.from.is_empty() {
            return Ok(Response::new(fail_status(
                WireError::InvalidRequest,
                "missing service name",
            )));
        }
        if !Self::caller_matches(&caller, &identity.from) {
            return Ok(Response::new(fail_status(
                WireError::InvalidRequest,
                "identity does not match authenticated service",
            )));
        }

        let Ok(_guard) = self.ctx.send_lock.try_lock() else {
            return Ok(Response::new(fail_status(
                WireError::ServerError,
                "Server busy",
            )));
        };

        match delete_prefix(&self.ctx.spool, &identity.from) {
            Ok(count) => {
                info!(service = %identity.from, count, "cleanup completed");
                Ok(Response::new(ok_status(format!(
                    "Cleanup completed ({count})"
                ))))
            }
            Err(err) => {
                warn!(service = %identity.from, error = %err, "cleanup failed");
                Ok(Response::new(fail_status(
                    WireError::ServerError,
                    err.to_string(),
                )))
            }
        }
    }
}

fn delete_prefix(spool: &Spool, service: &str) -> BrokerResult<usize> {
    let entries = spool.scan_prefix(&Spool::prefix(service))?;
    let mut count = 0;
    for (key, _) in entries {
        spool.delete(&key)?;
        count += 1;
    }
    Ok(count)
}

async fn receive_loop(
    ctx: Arc<AppContext>,
    service: String,
    session_id: Uuid,
    tx: mpsc::Sender<Result<Message, Status>>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(DRAIN_TICK);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(service = %service, "session cancelled");
                break;
            }
            _ = tx.closed() => {
                info!(service = %service, "client disconnected");
                break;
            }
            _ = tick.tick() => {
                if let Err(err) = drain_spool(&ctx, &service, &tx).await {
                    warn!(service = %service, error = %err, "failed to drain spooled messages");
                    // Best effort: tell the client why the stream is ending.
                    let _ = tx.send(Ok(error_message(&service, &err.to_string()))).await;
                    break;
                }
            }
        }
    }

    ctx.registry.unregister(&service, session_id);
    info!(service = %service, "session closed");
}

/// Replay every spooled message for `service` onto the stream, deleting each
/// entry only after its send succeeded. A failed send leaves the entry
/// persisted for the next session; an undecodable entry is skipped, not
/// deleted.
async fn drain_spool(
    ctx: &AppContext,
    service: &str,
    tx: &mpsc::Sender<Result<Message, Status>>,
) -> BrokerResult<()> {
    let entries = ctx.spool.scan_prefix(&Spool::prefix(service))?;
    for (key, value) in entries {
        let msg = match Message::decode(value.as_slice()) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(key = %key, error = %err, "skipping undecodable spool entry");
                continue;
            }
        };
        tx.send(Ok(msg))
            .await
            .map_err(|_| BrokerError::stream("receive stream closed mid-drain"))?;
        ctx.spool.delete(&key)?;
        debug!(key = %key, "delivered spooled message");
    }
    Ok(())
}

fn error_message(to: &str, reason: &str) -> Message {
    Message {
        data: reason.as_bytes().to_vec(),
        r#type: Type::Text as i32,
        queue: false,
        seq: Some(utils::now_timestamp()),
        from: BROKER_NAME.to_string(),
        to: to.to_string(),
        event: Event::Error as i32,
        done: false,
    }
}
