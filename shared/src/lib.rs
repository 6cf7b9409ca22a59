// Include the Protobuf generated code.
// This creates the `proto::broker::v1` module structure.
pub mod proto {
    pub mod broker {
        pub mod v1 {
            tonic::include_proto!("broker.v1");
        }
    }
}

pub mod auth;
pub mod context;
pub mod interceptor;
pub mod registry;
pub mod router;
pub mod service;
pub mod spool;
pub mod sweeper;
pub mod utils;

pub use context::AppContext;

/// Resolves when the process receives SIGTERM or Ctrl-C.
///
/// Passed to `serve_with_shutdown` so in-flight calls drain before exit.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, initiating graceful shutdown...");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, initiating graceful shutdown...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl-C received, initiating graceful shutdown...");
    }
}
