//! Background expiration sweeper for the spool.
//!
//! Wakes on the configured tick, takes a best-effort grab of the server
//! mutex (skipping the tick under contention), and deletes every spooled
//! message older than the configured maximum age.

use std::sync::Arc;

use prost::Message as _;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::proto::broker::v1::Message;
use crate::utils;

/// Spawn the sweeper task. The returned token stops it.
pub fn spawn_expiration_sweeper(ctx: Arc<AppContext>) -> CancellationToken {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    tokio::spawn(async move {
        run_sweeper_loop(ctx, task_cancel).await;
    });

    cancel
}

async fn run_sweeper_loop(ctx: Arc<AppContext>, cancel: CancellationToken) {
    let mut ticker = interval(ctx.config.server.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_secs = ctx.config.server.tick().as_secs(),
        max_age_secs = ctx.config.server.max_age_secs,
        "expiration sweeper started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("expiration sweeper shutting down");
                break;
            }
            _ = ticker.tick() => {
                sweep_once(&ctx);
            }
        }
    }
}

/// One sweep pass. Returns how many entries were evicted.
///
/// Never panics: scan and delete failures are logged and the pass moves on.
pub fn sweep_once(ctx: &AppContext) -> usize {
    let Ok(_guard) = ctx.send_lock.try_lock() else {
        debug!("server busy, skipping sweep tick");
        return 0;
    };

    let entries = match ctx.spool.scan_prefix("") {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "spool scan failed during sweep");
            return 0;
        }
    };

    let max_age_secs = ctx.config.server.max_age().as_secs() as i64;
    let now = chrono::Utc::now();
    let mut removed = 0;

    for (key, value) in entries {
        let msg = match Message::decode(value.as_slice()) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(key = %key, error = %err, "undecodable spool entry");
                continue;
            }
        };
        let Some(seq) = msg.seq.as_ref().and_then(utils::timestamp_datetime) else {
            continue;
        };
        if now.signed_duration_since(seq).num_seconds() > max_age_secs {
            match ctx.spool.delete(&key) {
                Ok(_) => {
                    info!(key = %key, "deleted expired message");
                    removed += 1;
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to delete expired message");
                }
            }
        }
    }

    removed
}
