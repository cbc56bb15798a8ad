//! Command-line client for the jobworker service.
//!
//! ```text
//! jobctl start -- ls -l /dev/null
//! jobctl query  <job-id>
//! jobctl stream <job-id>
//! jobctl stop   <job-id>
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tonic::transport::Channel;

use jobworker::proto::job_worker_client::JobWorkerClient;
use jobworker::proto::{JobRequest, JobResponse, JobStatus, StartJobRequest};
use jobworker::tls::TlsMaterial;

#[derive(Parser, Debug)]
#[command(name = "jobctl")]
#[command(about = "Client for the jobworker remote execution service")]
struct Cli {
    #[command(flatten)]
    connect: ConnectOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ConnectOpts {
    /// Server URL
    #[arg(long, default_value = "https://localhost:5678")]
    server_addr: String,

    /// Directory holding ca.crt and the client certificate pair
    #[arg(long, default_value = "certs")]
    cert_dir: PathBuf,

    /// Client name; its certificate is <name>.crt / <name>.key
    #[arg(long, default_value = "alice")]
    client_name: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a job; everything after `--` is the command and its arguments
    Start {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Stop a running job
    Stop { job_id: String },
    /// Show a job's current status
    Query { job_id: String },
    /// Tail a job's combined stdout/stderr
    Stream { job_id: String },
}

async fn connect(opts: &ConnectOpts) -> Result<JobWorkerClient<Channel>, Box<dyn std::error::Error>> {
    let tls = TlsMaterial::load_client(&opts.cert_dir, &opts.client_name).await?;

    let channel = Channel::from_shared(opts.server_addr.clone())?
        .tls_config(tls.client_tls_config())?
        .connect()
        .await?;

    Ok(JobWorkerClient::new(channel))
}

fn print_response(response: &JobResponse) {
    let status = JobStatus::try_from(response.status)
        .map(|s| s.as_str_name().to_string())
        .unwrap_or_else(|_| format!("unknown ({})", response.status));

    println!("job_id:    {}", response.job_id);
    println!("pid:       {}", response.pid);
    println!("exit_code: {}", response.exit_code);
    println!("status:    {status}");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut client = connect(&cli.connect).await?;

    match cli.command {
        Command::Start { command } => {
            let request = StartJobRequest {
                command: command[0].clone(),
                arguments: command[1..].to_vec(),
            };
            let response = client.start_job(request).await?.into_inner();
            print_response(&response);
        }
        Command::Stop { job_id } => {
            let response = client.stop_job(JobRequest { job_id }).await?.into_inner();
            print_response(&response);
        }
        Command::Query { job_id } => {
            let response = client.query_job(JobRequest { job_id }).await?.into_inner();
            print_response(&response);
        }
        Command::Stream { job_id } => {
            let mut stream = client.stream_job(JobRequest { job_id }).await?.into_inner();
            let mut stdout = tokio::io::stdout();

            while let Some(chunk) = stream.message().await? {
                stdout.write_all(&chunk.message).await?;
                stdout.flush().await?;
            }
        }
    }

    Ok(())
}
