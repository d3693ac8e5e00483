mod server;
mod shutdown;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use joblib::auth::{Middleware, MtlsAuthenticator};
use joblib::rbac::PolicyMiddleware;
use joblib::RuntimeRegistry;
use protobuf::rbac::v1::Config;
use server::{Options, Server};

/// Run the remote job execution server.
#[derive(Debug, Parser)]
#[command(name = "jobserver")]
struct Args {
    /// Address to listen on
    #[arg(short = 'a', long, default_value = "127.0.0.1:9097")]
    listen_address: String,

    /// Path to a configuration file containing rbac rules
    #[arg(long)]
    rbac: PathBuf,

    /// Path to the CA certificate
    #[arg(long)]
    cacert: PathBuf,

    /// Path to the server certificate
    #[arg(long)]
    cert: PathBuf,

    /// Path to the server key
    #[arg(long)]
    key: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = load_rbac_config(&args.rbac)?;
    let middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(MtlsAuthenticator),
        Arc::new(PolicyMiddleware::new(config)),
    ];

    let registry = RuntimeRegistry::with_defaults();
    let runtime = registry.build_detected()?;

    let options = Options {
        listen_address: args.listen_address,
        ca_cert_file: args.cacert,
        cert_file: args.cert,
        key_file: args.key,
    };

    let shutdown = shutdown::install_shutdown_handler();
    let server = Server::new(runtime, options, middlewares);
    server.listen_and_serve(shutdown).await?;
    Ok(())
}

/// Parses and validates the RBAC policy file. YAML and JSON are both
/// accepted; field names follow the protobuf JSON form.
fn load_rbac_config(path: &PathBuf) -> Result<Config, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read rbac configuration file: {err}"))?;
    let config: Config = serde_yaml::from_str(&contents)
        .map_err(|err| format!("failed to parse RBAC configuration: {err}"))?;
    config
        .validate()
        .map_err(|err| format!("invalid rbac configuration: {err}"))?;
    Ok(config)
}
