// ============================================================================
// Test Utilities
// ============================================================================
//
// Shared infrastructure for the broker integration tests: temp-dir backed
// contexts, message builders, and an in-process gRPC server with
// authenticating client helpers.
//
// ============================================================================

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::transport::{Channel, Server};

use courier_config::{AuthMethod, Config};
use courier_shared::AppContext;
use courier_shared::auth::AuthManager;
use courier_shared::interceptor::AuthLayer;
use courier_shared::proto::broker::v1::broker_client::BrokerClient;
use courier_shared::proto::broker::v1::broker_server::BrokerServer;
use courier_shared::proto::broker::v1::{Identity, Message, Type};
use courier_shared::service::BrokerService;
use courier_shared::spool::Spool;

pub const TEST_SECRET: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

pub struct TestBroker {
    pub ctx: Arc<AppContext>,
    pub auth: Arc<AuthManager>,
    // Kept alive for the duration of the test; the spool lives inside.
    _dir: tempfile::TempDir,
}

impl TestBroker {
    /// Context with authentication disabled (handler-level tests).
    pub fn open() -> Self {
        Self::with_config(|config| {
            config.auth.enabled = false;
        })
    }

    /// Context with signed-token authentication enabled.
    pub fn open_authenticated() -> Self {
        Self::with_config(|config| {
            config.auth.enabled = true;
            config.auth.method = AuthMethod::SignedToken;
            config.auth.signing_secret = TEST_SECRET.to_string();
        })
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut config = Config::default();
        config.database.path = dir.path().join("spool");
        config.rust_log = "info".to_string();
        tweak(&mut config);

        let config = Arc::new(config);
        let spool = Arc::new(Spool::open(&config.database.path).expect("open spool"));
        let auth = Arc::new(AuthManager::new(&config.auth));
        let ctx = Arc::new(AppContext::new(config, spool, auth.clone()));

        Self {
            ctx,
            auth,
            _dir: dir,
        }
    }

    /// Serve the broker on an ephemeral loopback port, auth layer included.
    pub async fn serve(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let service = BrokerService::new(self.ctx.clone());
        let layer = AuthLayer::new(self.auth.clone());
        tokio::spawn(async move {
            Server::builder()
                .layer(layer)
                .add_service(BrokerServer::new(service))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .expect("test server failed");
        });

        addr
    }
}

pub fn text_message(from: &str, to: &str, data: &str, queue: bool) -> Message {
    Message {
        data: data.as_bytes().to_vec(),
        r#type: Type::Text as i32,
        queue,
        seq: None,
        from: from.to_string(),
        to: to.to_string(),
        event: 0,
        done: false,
    }
}

pub fn identity(from: &str) -> Identity {
    Identity {
        from: from.to_string(),
    }
}

/// Client interceptor attaching a fixed metadata credential to every call.
#[derive(Clone)]
pub struct CredentialInterceptor {
    header: &'static str,
    value: MetadataValue<Ascii>,
}

impl Interceptor for CredentialInterceptor {
    fn call(&mut self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        req.metadata_mut().insert(self.header, self.value.clone());
        Ok(req)
    }
}

pub type AuthedClient =
    BrokerClient<tonic::service::interceptor::InterceptedService<Channel, CredentialInterceptor>>;

pub async fn connect(addr: SocketAddr) -> BrokerClient<Channel> {
    BrokerClient::new(channel(addr).await)
}

pub async fn connect_with_token(addr: SocketAddr, token: &str) -> AuthedClient {
    let value: MetadataValue<Ascii> = format!("Bearer {token}").parse().expect("metadata value");
    BrokerClient::with_interceptor(
        channel(addr).await,
        CredentialInterceptor {
            header: "authorization",
            value,
        },
    )
}

pub async fn connect_with_api_key(addr: SocketAddr, key: &str) -> AuthedClient {
    let value: MetadataValue<Ascii> = key.parse().expect("metadata value");
    BrokerClient::with_interceptor(
        channel(addr).await,
        CredentialInterceptor {
            header: "x-api-key",
            value,
        },
    )
}

async fn channel(addr: SocketAddr) -> Channel {
    Channel::from_shared(format!("http://{addr}"))
        .expect("endpoint")
        .connect()
        .await
        .expect("connect")
}
