//! Authentication layer for the gRPC server.
//!
//! Every call passes through here before any handler runs. The layer sits at
//! the http level rather than in a per-service interceptor so it can see the
//! method path (the Ping exemption) and cover unary and streaming calls with
//! one code path. On success the resolved service name is attached to the
//! request extensions; on failure the call is answered with a trailers-only
//! `UNAUTHENTICATED` response.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use http::{HeaderValue, Request, Response};
use tonic::body::Body;
use tower::{Layer, Service};
use tracing::warn;

use crate::auth::AuthManager;

/// Authenticated service name bound to the request by [`AuthLayer`].
///
/// Handlers read this from the request extensions to learn who is calling.
#[derive(Clone, Debug)]
pub struct AuthenticatedService(pub String);

#[derive(Clone)]
pub struct AuthLayer {
    auth: Arc<AuthManager>,
}

impl AuthLayer {
    pub fn new(auth: Arc<AuthManager>) -> Self {
        Self { auth }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            auth: self.auth.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    auth: Arc<AuthManager>,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let auth = self.auth.clone();
        // Swap out the service that was polled ready; the clone starts fresh.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match auth.validate(req.uri().path(), req.headers()) {
                Ok(service) => {
                    req.extensions_mut().insert(AuthenticatedService(service));
                    inner.call(req).await
                }
                Err(err) => {
                    warn!(path = %req.uri().path(), reason = %err, "rejected call");
                    Ok(unauthenticated_response(&err.to_string()))
                }
            }
        })
    }
}

/// Trailers-only gRPC response carrying `UNAUTHENTICATED` in the headers.
fn unauthenticated_response(reason: &str) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    headers.insert(
        "grpc-status",
        HeaderValue::from_static("16"), // tonic::Code::Unauthenticated
    );
    if let Ok(message) = HeaderValue::from_str(reason) {
        headers.insert("grpc-message", message);
    }
    response
}
