mod client;
mod limits;

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use client::{Client, TlsOptions};
use protobuf::job::v1::{CommandSpec, JobId, JobSpec, ResourceLimits, State};

/// Interact with a remote job server over mutual TLS.
#[derive(Debug, Parser)]
#[command(name = "jobctl")]
struct Cli {
    /// The address of the server
    #[arg(short = 's', long = "server", default_value = "127.0.0.1:9097")]
    server: String,

    /// Path to the CA certificate
    #[arg(long)]
    cacert: PathBuf,

    /// Path to the client certificate
    #[arg(long)]
    cert: PathBuf,

    /// Path to the client key
    #[arg(long)]
    key: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a new job and print its id
    #[command(alias = "start")]
    Run {
        /// Environment variables (ex: 'FOO=bar')
        #[arg(short = 'e', long = "env")]
        env: Vec<String>,

        /// Number of CPUs to allocate to the job (ex: '4', '100m')
        #[arg(short = 'c', long)]
        cpus: Option<String>,

        /// Amount of memory to allocate to the job (ex: '100Mi', '256k', '4G')
        #[arg(short = 'm', long)]
        memory: Option<String>,

        /// Soft limit for memory usage (ex: '100Mi', '256k', '4G')
        #[arg(long)]
        memory_soft_limit: Option<String>,

        /// Device read bandwidth limits (ex: '8:16=200', '/dev/sda=200')
        #[arg(long)]
        device_read_bps: Vec<String>,

        /// Device write bandwidth limits (ex: '8:16=200', '/dev/sda=200')
        #[arg(long)]
        device_write_bps: Vec<String>,

        /// Device read IOPS limits (ex: '8:16=200', '/dev/sda=200')
        #[arg(long)]
        device_read_iops: Vec<String>,

        /// Device write IOPS limits (ex: '8:16=200', '/dev/sda=200')
        #[arg(long)]
        device_write_iops: Vec<String>,

        /// Follow the output of the job
        #[arg(short = 'f', long)]
        follow: bool,

        /// The command to run and its arguments, delimited with '--' when
        /// the command takes flags of its own
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Stop a running job
    Stop { id: String },
    /// Show the status of a job
    Status { id: String },
    /// List job ids
    List,
    /// Stream the output of a job from the beginning
    Logs { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let tls = TlsOptions {
        cacert: cli.cacert,
        cert: cli.cert,
        key: cli.key,
    };
    let mut client = Client::connect(&cli.server, &tls).await?;

    match cli.command {
        Command::Run {
            env,
            cpus,
            memory,
            memory_soft_limit,
            device_read_bps,
            device_write_bps,
            device_read_iops,
            device_write_iops,
            follow,
            command,
        } => {
            let spec = build_spec(
                command,
                env,
                cpus,
                memory,
                memory_soft_limit,
                device_read_bps,
                device_write_bps,
                device_read_iops,
                device_write_iops,
            )?;
            let id = client.start(spec).await?;
            if follow {
                stream_output(&mut client, id).await?;
            } else {
                println!("{}", id.id);
            }
        }
        Command::Stop { id } => {
            client.stop(JobId { id: id.clone() }).await?;
            println!("stopped job {id}");
        }
        Command::Status { id } => {
            let status = client.status(JobId { id }).await?;
            print_status(&status);
        }
        Command::List => {
            for item in client.list().await?.items {
                println!("{}", item.id);
            }
        }
        Command::Logs { id } => {
            stream_output(&mut client, JobId { id }).await?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_spec(
    command: Vec<String>,
    env: Vec<String>,
    cpus: Option<String>,
    memory: Option<String>,
    memory_soft_limit: Option<String>,
    device_read_bps: Vec<String>,
    device_write_bps: Vec<String>,
    device_read_iops: Vec<String>,
    device_write_iops: Vec<String>,
) -> Result<JobSpec, Box<dyn std::error::Error>> {
    let mut parts = command.into_iter();
    let command_spec = CommandSpec {
        command: parts.next().unwrap_or_default(),
        args: parts.collect(),
        env,
    };

    let mut limits = ResourceLimits::default();
    let mut any_limit = false;
    if let Some(cpus) = cpus {
        limits.cpu = Some(limits::parse_cpu_limit(&cpus)?);
        any_limit = true;
    }
    if memory.is_some() || memory_soft_limit.is_some() {
        limits.memory = Some(limits::parse_memory_limits(
            memory_soft_limit.as_deref(),
            memory.as_deref(),
        )?);
        any_limit = true;
    }
    let io = limits::parse_io_limits(
        &device_read_bps,
        &device_write_bps,
        &device_read_iops,
        &device_write_iops,
    )?;
    if !io.is_empty() {
        limits.io = io;
        any_limit = true;
    }

    Ok(JobSpec {
        command: Some(command_spec),
        limits: any_limit.then_some(limits),
    })
}

async fn stream_output(client: &mut Client, id: JobId) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = client.output(id).await?;
    let mut stdout = std::io::stdout();
    while let Some(output) = stream.message().await? {
        if let Err(err) = stdout.write_all(&output.output) {
            if err.kind() == std::io::ErrorKind::BrokenPipe {
                break;
            }
            return Err(err.into());
        }
    }
    Ok(())
}

fn print_status(status: &protobuf::job::v1::JobStatus) {
    let state = State::try_from(status.state).unwrap_or(State::Pending);
    println!("state:    {}", state.as_str_name());
    if status.pid != 0 {
        println!("pid:      {}", status.pid);
    }
    println!("message:  {}", status.message);
    if let Some(terminated) = &status.terminated {
        println!("stopped:  {}", terminated.stopped);
        if terminated.signal != 0 {
            println!("signal:   {}", terminated.signal);
        } else {
            println!("exit code: {}", terminated.exit_code);
        }
    }
}
