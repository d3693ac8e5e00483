//! A thin wrapper around the generated job client that handles mTLS channel
//! setup.

use std::path::PathBuf;
use std::time::Duration;

use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::{Status, Streaming};

use protobuf::job::v1::job_client::JobClient;
use protobuf::job::v1::{JobId, JobIdList, JobSpec, JobStatus, ProcessOutput};

const MAX_RECV_MESSAGE_SIZE: usize = 8 * 1024 * 1024;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub struct TlsOptions {
    pub cacert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

pub struct Client {
    inner: JobClient<Channel>,
}

impl Client {
    pub async fn connect(
        server_addr: &str,
        tls: &TlsOptions,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let ca_cert = tokio::fs::read(&tls.cacert)
            .await
            .map_err(|err| format!("failed to read {}: {err}", tls.cacert.display()))?;
        let cert = tokio::fs::read(&tls.cert)
            .await
            .map_err(|err| format!("failed to read {}: {err}", tls.cert.display()))?;
        let key = tokio::fs::read(&tls.key)
            .await
            .map_err(|err| format!("failed to read {}: {err}", tls.key.display()))?;

        let tls_config = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca_cert))
            .identity(Identity::from_pem(cert, key));

        let channel = Channel::from_shared(format!("https://{server_addr}"))?
            .tls_config(tls_config)?
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_while_idle(true)
            .connect()
            .await?;

        Ok(Self {
            inner: JobClient::new(channel).max_decoding_message_size(MAX_RECV_MESSAGE_SIZE),
        })
    }

    pub async fn start(&mut self, spec: JobSpec) -> Result<JobId, Status> {
        Ok(self.inner.start(spec).await?.into_inner())
    }

    pub async fn stop(&mut self, id: JobId) -> Result<(), Status> {
        self.inner.stop(id).await?;
        Ok(())
    }

    pub async fn status(&mut self, id: JobId) -> Result<JobStatus, Status> {
        Ok(self.inner.status(id).await?.into_inner())
    }

    pub async fn list(&mut self) -> Result<JobIdList, Status> {
        Ok(self.inner.list(()).await?.into_inner())
    }

    pub async fn output(&mut self, id: JobId) -> Result<Streaming<ProcessOutput>, Status> {
        Ok(self.inner.output(id).await?.into_inner())
    }
}
