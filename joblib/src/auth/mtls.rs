//! Peer identity extraction from the verified client certificate chain.

use tonic::Status;
use x509_parser::prelude::{FromDer, X509Certificate};

use super::{CallContext, Middleware, PeerInfo};

/// Authenticates the caller as the Subject CommonName of the leaf
/// certificate in the verified client chain. Requires the transport to be
/// configured with mandatory client certificate verification.
pub struct MtlsAuthenticator;

impl Middleware for MtlsAuthenticator {
    fn evaluate(&self, mut cx: CallContext) -> Result<CallContext, Status> {
        let certs = match cx.peer() {
            PeerInfo::Unknown => return Err(Status::internal("no peer info found")),
            PeerInfo::NotTls => {
                return Err(Status::unauthenticated("unknown auth type: expected tls"))
            }
            PeerInfo::Tls(certs) => certs
                .as_ref()
                .filter(|certs| !certs.is_empty())
                .ok_or_else(|| Status::unauthenticated("no verified client certificate found"))?,
        };

        // the chain is leaf-first; only the leaf identifies the caller
        let leaf = &certs[0];
        let subject = match X509Certificate::from_der(leaf.as_ref()) {
            Ok((rest, cert)) if rest.is_empty() => cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_owned),
            _ => return Err(Status::unauthenticated("bad client certificate")),
        };

        match subject.filter(|cn| !cn.is_empty()) {
            Some(cn) => {
                cx.set_authenticated_user(cn);
                Ok(cx)
            }
            None => Err(Status::unauthenticated(
                "no subject common name found in any verified chains",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn missing_peer_info_is_internal() {
        let cx = CallContext::new("/job.v1.Job/List".into(), PeerInfo::Unknown);
        let err = MtlsAuthenticator.evaluate(cx).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn non_tls_peer_is_unauthenticated() {
        let cx = CallContext::new("/job.v1.Job/List".into(), PeerInfo::NotTls);
        let err = MtlsAuthenticator.evaluate(cx).unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[test]
    fn missing_client_chain_is_unauthenticated() {
        let cx = CallContext::new("/job.v1.Job/List".into(), PeerInfo::Tls(None));
        let err = MtlsAuthenticator.evaluate(cx).unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);

        let cx = CallContext::new(
            "/job.v1.Job/List".into(),
            PeerInfo::Tls(Some(std::sync::Arc::new(Vec::new()))),
        );
        let err = MtlsAuthenticator.evaluate(cx).unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[test]
    fn garbage_certificate_is_unauthenticated() {
        let certs = vec![tokio_rustls::rustls::pki_types::CertificateDer::from(
            b"not a certificate".to_vec(),
        )];
        let cx = CallContext::new(
            "/job.v1.Job/List".into(),
            PeerInfo::Tls(Some(std::sync::Arc::new(certs))),
        );
        let err = MtlsAuthenticator.evaluate(cx).unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }
}
