//! Authentication middleware for the gRPC server.
//!
//! Every RPC passes through an ordered chain of [`Middleware`]s, each of
//! which may enrich the per-call [`CallContext`] or reject the call. The
//! default chain is the mTLS authenticator followed by the RBAC policy
//! middleware; handlers then read the authenticated user and resolved method
//! permissions back out of the context.

mod layer;
mod mtls;

use std::sync::Arc;

use tokio_rustls::rustls::pki_types::CertificateDer;
use tonic::Status;

use protobuf::rbac::v1::AllowedMethod;

pub use layer::AuthLayer;
pub use mtls::MtlsAuthenticator;

pub type AuthenticatedUser = String;

/// Transport-level peer information captured when the call enters the server.
#[derive(Debug, Clone)]
pub enum PeerInfo {
    /// No connection info was recorded for this call.
    Unknown,
    /// The connection did not complete a TLS handshake.
    NotTls,
    /// TLS, with the verified client certificate chain if one was presented.
    Tls(Option<Arc<Vec<CertificateDer<'static>>>>),
}

/// The per-call authentication and authorization record, built up by the
/// middleware chain and handed to the handler through request extensions.
#[derive(Debug, Clone)]
pub struct CallContext {
    full_method: String,
    peer: PeerInfo,
    user: Option<AuthenticatedUser>,
    allowed_method: Option<AllowedMethod>,
}

impl CallContext {
    pub fn new(full_method: String, peer: PeerInfo) -> Self {
        Self {
            full_method,
            peer,
            user: None,
            allowed_method: None,
        }
    }

    /// The fully qualified method name, `/<package>.<Service>/<Method>`.
    pub fn full_method(&self) -> &str {
        &self.full_method
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn set_authenticated_user(&mut self, user: AuthenticatedUser) {
        self.user = Some(user);
    }

    /// The authenticated user name. Must only be called from handlers and
    /// middlewares running behind the authentication middleware.
    pub fn authenticated_user(&self) -> &str {
        self.user
            .as_deref()
            .expect("bug: no authenticated user found in call context (mtls middleware not configured)")
    }

    pub fn set_allowed_method(&mut self, method: AllowedMethod) {
        self.allowed_method = Some(method);
    }

    /// The resolved method permission. Must only be called from handlers
    /// running behind the policy middleware.
    pub fn allowed_method(&self) -> &AllowedMethod {
        self.allowed_method
            .as_ref()
            .expect("bug: allowed method not found in call context (policy middleware not configured)")
    }
}

/// One element of the per-call middleware chain. Failures short-circuit the
/// chain and are returned to the client.
pub trait Middleware: Send + Sync {
    fn evaluate(&self, cx: CallContext) -> Result<CallContext, Status>;
}
