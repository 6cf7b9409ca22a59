use std::sync::Arc;

use tokio::sync::Mutex;

use courier_config::Config;

use crate::auth::AuthManager;
use crate::registry::SessionRegistry;
use crate::router::Router;
use crate::spool::Spool;

/// Application context containing shared dependencies.
///
/// The server-wide `send_lock` serializes Send, Cleanup and the expiration
/// sweeper; every acquisition is a `try_lock`, so contention surfaces as
/// `Server busy` instead of unbounded queueing.
pub struct AppContext {
    pub config: Arc<Config>,
    pub spool: Arc<Spool>,
    pub registry: Arc<SessionRegistry>,
    pub auth: Arc<AuthManager>,
    pub send_lock: Arc<Mutex<()>>,
    pub router: Router,
}

impl AppContext {
    pub fn new(config: Arc<Config>, spool: Arc<Spool>, auth: Arc<AuthManager>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let send_lock = Arc::new(Mutex::new(()));
        let router = Router::new(registry.clone(), spool.clone(), send_lock.clone());
        Self {
            config,
            spool,
            registry,
            auth,
            send_lock,
            router,
        }
    }
}
