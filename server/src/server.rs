//! The job server: registry, RPC surface, and serving lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tonic::{Request, Response, Status};

use joblib::auth::{AuthLayer, AuthenticatedUser, CallContext, Middleware};
use joblib::rbac;
use joblib::{CancelCause, CancelHandle, Process, Runtime};
use protobuf::job::v1::job_server::{Job, JobServer};
use protobuf::job::v1::{JobId, JobIdList, JobSpec, JobStatus, ProcessOutput, State};

/// One output frame carries at most this many bytes, keeping frames well
/// under the client's 8 MiB receive limit.
const MAX_FRAME_SIZE: usize = 512 * 1024;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Options {
    pub listen_address: String,
    pub ca_cert_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid listen address {address:?}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to read CA certificate: {0}")]
    ReadCaCert(#[source] std::io::Error),
    #[error("failed to load server certificate: {0}")]
    ReadCert(#[source] std::io::Error),
    #[error("failed to load server key: {0}")]
    ReadKey(#[source] std::io::Error),
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}

struct JobEntry {
    process: Arc<dyn Process>,
    owner: AuthenticatedUser,
    cancel: CancelHandle,
}

pub struct Server {
    options: Options,
    middlewares: Vec<Arc<dyn Middleware>>,
    runtime: Arc<dyn Runtime>,
    // jobs are never evicted; terminated jobs stay visible to Status and
    // List for the lifetime of the server
    jobs: Mutex<HashMap<String, JobEntry>>,
}

impl Server {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        options: Options,
        middlewares: Vec<Arc<dyn Middleware>>,
    ) -> Self {
        Self {
            options,
            middlewares,
            runtime,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Serves the job API over mutual TLS until `shutdown` fires or the
    /// server exits on its own.
    pub async fn listen_and_serve(self, shutdown: CancellationToken) -> Result<(), ServeError> {
        let options = self.options.clone();
        let addr: SocketAddr =
            options
                .listen_address
                .parse()
                .map_err(|source| ServeError::InvalidAddress {
                    address: options.listen_address.clone(),
                    source,
                })?;

        let ca_cert = tokio::fs::read(&options.ca_cert_file)
            .await
            .map_err(ServeError::ReadCaCert)?;
        let cert = tokio::fs::read(&options.cert_file)
            .await
            .map_err(ServeError::ReadCert)?;
        let key = tokio::fs::read(&options.key_file)
            .await
            .map_err(ServeError::ReadKey)?;

        let tls = ServerTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .client_ca_root(Certificate::from_pem(ca_cert));

        let layer = AuthLayer::new(self.middlewares.clone());

        tracing::info!(address = %addr, "job server starting");
        let result = tonic::transport::Server::builder()
            .tls_config(tls)?
            .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
            .http2_keepalive_timeout(Some(KEEPALIVE_TIMEOUT))
            .layer(layer)
            .add_service(JobServer::new(self))
            .serve_with_shutdown(addr, shutdown.cancelled_owned())
            .await;

        match &result {
            Ok(()) => tracing::info!("job server stopped"),
            Err(err) => tracing::error!(error = %err, "job server exited with error"),
        }
        Ok(result?)
    }

    fn entry(&self, id: &str) -> Option<(Arc<dyn Process>, AuthenticatedUser, CancelHandle)> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(id)
            .map(|entry| (entry.process.clone(), entry.owner.clone(), entry.cancel.clone()))
    }
}

/// Reads the call context the auth layer attached to the request.
fn call_context<T>(request: &Request<T>) -> CallContext {
    request
        .extensions()
        .get::<CallContext>()
        .cloned()
        .expect("bug: call context not found in request (auth layer not configured)")
}

struct OwnedJobId {
    id: JobId,
    owner: AuthenticatedUser,
}

impl rbac::UserAssignable for OwnedJobId {
    fn assigned_user(&self) -> &str {
        &self.owner
    }
}

#[tonic::async_trait]
impl Job for Server {
    async fn start(&self, request: Request<JobSpec>) -> Result<Response<JobId>, Status> {
        let cx = call_context(&request);
        let owner = cx.authenticated_user().to_owned();
        let spec = request.into_inner();

        // the job's lifetime is decoupled from this RPC: the caller
        // disconnecting must not kill the job
        let cancel = CancelHandle::new();
        let process = match self.runtime.execute(cancel.clone(), spec) {
            Ok(process) => process,
            Err(err) => {
                cancel.cancel(CancelCause::Other(err.to_string()));
                tracing::error!(error = %err, "failed to start job");
                return Err(Status::internal(err.to_string()));
            }
        };

        let id = process.id().to_owned();
        self.jobs.lock().unwrap().insert(
            id.clone(),
            JobEntry {
                process,
                owner,
                cancel,
            },
        );
        Ok(Response::new(JobId { id }))
    }

    async fn stop(&self, request: Request<JobId>) -> Result<Response<()>, Status> {
        let id = request.into_inner().id;
        let (process, _, cancel) = self
            .entry(&id)
            .ok_or_else(|| Status::not_found(format!("job {id} not found")))?;

        if process.status().state != State::Running as i32 {
            return Err(Status::failed_precondition(format!(
                "job {id} is not running"
            )));
        }

        cancel.cancel(CancelCause::UserStop);
        // resolve once the process has actually exited, not merely once the
        // signal was delivered
        process.done().cancelled_owned().await;
        Ok(Response::new(()))
    }

    async fn status(&self, request: Request<JobId>) -> Result<Response<JobStatus>, Status> {
        let cx = call_context(&request);
        let id = request.into_inner().id;

        // scope-check before revealing whether the job exists
        let entry = self.entry(&id);
        let owner = entry.as_ref().map(|(_, owner, _)| owner.as_str()).unwrap_or_default();
        rbac::verify_scope_for_user(&cx, owner)?;

        let (process, _, _) =
            entry.ok_or_else(|| Status::not_found(format!("job {id} not found")))?;
        Ok(Response::new(process.status()))
    }

    async fn list(&self, request: Request<()>) -> Result<Response<JobIdList>, Status> {
        let cx = call_context(&request);
        let snapshot: Vec<OwnedJobId> = {
            let jobs = self.jobs.lock().unwrap();
            jobs.iter()
                .map(|(id, entry)| OwnedJobId {
                    id: JobId { id: id.clone() },
                    owner: entry.owner.clone(),
                })
                .collect()
        };
        let visible = rbac::filter_by_scope(&cx, snapshot)?;
        Ok(Response::new(JobIdList {
            items: visible.into_iter().map(|item| item.id).collect(),
        }))
    }

    type OutputStream = ReceiverStream<Result<ProcessOutput, Status>>;

    async fn output(&self, request: Request<JobId>) -> Result<Response<Self::OutputStream>, Status> {
        let id = request.into_inner().id;
        let (process, _, _) = self
            .entry(&id)
            .ok_or_else(|| Status::not_found(format!("job {id} not found")))?;

        let cancel = CancellationToken::new();
        let mut source = process.output(cancel.clone());
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            // stop the buffer reader as soon as this forwarder exits
            let _guard = cancel.drop_guard();
            loop {
                tokio::select! {
                    received = source.recv() => {
                        let Some(buf) = received else { break };
                        for frame in frames(buf) {
                            if tx.send(Ok(ProcessOutput { output: frame })).await.is_err() {
                                return;
                            }
                        }
                    }
                    () = tx.closed() => return,
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Splits a buffer read into frames of at most [`MAX_FRAME_SIZE`] bytes,
/// preserving order.
fn frames(mut buf: Bytes) -> impl Iterator<Item = Bytes> {
    std::iter::from_fn(move || {
        if buf.is_empty() {
            return None;
        }
        Some(buf.split_to(buf.len().min(MAX_FRAME_SIZE)))
    })
}
