//! A tower layer that runs the middleware chain on every RPC.
//!
//! This is the transport hook: it captures peer TLS info from the request
//! extensions, builds the [`CallContext`], evaluates each middleware in
//! order, and either injects the finished context for the handler or answers
//! with the failing status without invoking the handler at all.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::header::{HeaderValue, CONTENT_TYPE};
use tonic::transport::server::{TcpConnectInfo, TlsConnectInfo};
use tonic::Status;
use tower::{Layer, Service};

use super::{CallContext, Middleware, PeerInfo};

#[derive(Clone)]
pub struct AuthLayer {
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
}

impl AuthLayer {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            middlewares: Arc::new(middlewares),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            middlewares: self.middlewares.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for AuthService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        // the clone takes the ready inner service; see tower's docs on
        // Clone + readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let middlewares = self.middlewares.clone();

        Box::pin(async move {
            let peer = peer_info(&req);
            let mut call_cx = CallContext::new(req.uri().path().to_owned(), peer);
            for middleware in middlewares.iter() {
                match middleware.evaluate(call_cx) {
                    Ok(next) => call_cx = next,
                    Err(status) => return Ok(deny(status)),
                }
            }
            req.extensions_mut().insert(call_cx);
            inner.call(req).await
        })
    }
}

fn peer_info<B>(req: &http::Request<B>) -> PeerInfo {
    if let Some(tls) = req.extensions().get::<TlsConnectInfo<TcpConnectInfo>>() {
        PeerInfo::Tls(tls.peer_certs())
    } else if req.extensions().get::<TcpConnectInfo>().is_some() {
        PeerInfo::NotTls
    } else {
        PeerInfo::Unknown
    }
}

/// Builds the gRPC error response for a rejected call.
fn deny<B: Default>(status: Status) -> http::Response<B> {
    let mut response = http::Response::new(B::default());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    if let Err(err) = status.add_header(response.headers_mut()) {
        tracing::error!(error = %err, "failed to encode status headers");
        response
            .headers_mut()
            .insert("grpc-status", HeaderValue::from_static("13"));
    }
    response
}
