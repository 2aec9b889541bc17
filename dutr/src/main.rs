//! DUT remote agent client CLI.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use dutr::{CompletionListener, RpcClient, discover, pull_tar, push_tar};
use dutr_common::{LogConfig, init_logging};

#[derive(Parser)]
#[command(name = "dutr")]
#[command(author, version, about = "Client for the DUT remote agent")]
struct Cli {
    /// Agent host
    #[arg(short = 'H', long, default_value = "127.0.0.1", global = true)]
    host: String,

    /// Agent RPC port
    #[arg(short, long, default_value = "8000", global = true)]
    port: u16,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the agent version
    Version,

    /// Check the agent is alive
    Heartbeat,

    /// Ask the agent how it sees this client's address
    ClientIp,

    /// Start a tracked job and print its id
    Start {
        program: String,
        args: Option<String>,
    },

    /// Start a tracked job, wait for its completion callback, then
    /// print the collected output
    StartWait {
        program: String,
        args: Option<String>,
    },

    /// Poll whether a job has finished
    Status { job_id: u64 },

    /// Stop a running job
    Stop { job_id: u64 },

    /// Collect a finished job's output (removes it from the agent)
    Result { job_id: u64 },

    /// List tracked jobs and their completion state
    Jobs,

    /// Run fire-and-forget
    Run {
        program: String,
        args: Option<String>,
    },

    /// Run and wait for merged output
    RunResult {
        program: String,
        args: Option<String>,
    },

    /// Kill processes on the agent host by image name
    Kill { process_name: String },

    /// Push a local file or directory to the agent
    Upload {
        local_path: PathBuf,
        remote_dest: String,
        /// Replace files that already exist at the destination
        #[arg(long)]
        overwrite: bool,
    },

    /// Pull a remote path (glob suffix allowed) from the agent
    Download {
        remote_path: String,
        local_dest: PathBuf,
    },

    /// Probe for an agent via UDP discovery
    Discover {
        /// Discovery target (broadcast or unicast address)
        #[arg(default_value = "255.255.255.255")]
        target: String,
        /// Discovery UDP port
        #[arg(default_value = "8001")]
        discovery_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("warn").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _ = init_logging(&log_config);

    let mut client = RpcClient::new(cli.host.clone(), cli.port);

    match cli.command {
        Commands::Version => {
            println!("{}", client.get_version().await?);
        }
        Commands::Heartbeat => {
            let alive = client.get_heartbeat().await?;
            println!("{alive}");
        }
        Commands::ClientIp => {
            println!("{}", client.get_client_ip().await?);
        }
        Commands::Start { program, args } => {
            let id = client.start_job(&program, args.as_deref()).await?;
            println!("{id}");
        }
        Commands::StartWait { program, args } => {
            let listener = CompletionListener::bind().await?;
            let callback_port = i32::from(listener.port()?);
            // Empty address: the agent substitutes this client's own IP.
            let id = client
                .start_job_with_notification("", callback_port, &program, args.as_deref())
                .await?;
            let done = listener
                .accept_completion(Duration::from_secs(600))
                .await?;
            anyhow::ensure!(done == id, "callback for job {done}, expected {id}");
            print!("{}", client.get_job_result(id).await?);
        }
        Commands::Status { job_id } => {
            println!("{}", client.is_job_complete(job_id).await?);
        }
        Commands::Stop { job_id } => {
            client.stop_job(job_id).await?;
            println!("stopped {job_id}");
        }
        Commands::Result { job_id } => {
            print!("{}", client.get_job_result(job_id).await?);
        }
        Commands::Jobs => {
            let mut jobs: Vec<(u64, bool)> = client.get_all_jobs().await?.into_iter().collect();
            jobs.sort_unstable();
            for (id, done) in jobs {
                println!("{id}\t{}", if done { "done" } else { "running" });
            }
        }
        Commands::Run { program, args } => {
            client.run(&program, args.as_deref()).await?;
        }
        Commands::RunResult { program, args } => {
            print!("{}", client.run_with_result(&program, args.as_deref()).await?);
        }
        Commands::Kill { process_name } => {
            client.kill_process(&process_name).await?;
        }
        Commands::Upload {
            local_path,
            remote_dest,
            overwrite,
        } => {
            let port = client.upload(&remote_dest, overwrite, 0).await?;
            let bytes = push_tar(&cli.host, port, &local_path).await?;
            println!("{bytes} bytes transferred");
        }
        Commands::Download {
            remote_path,
            local_dest,
        } => {
            let (port, total) = client.download(&remote_path, 0).await?;
            pull_tar(&cli.host, port, &local_dest).await?;
            println!("{total} bytes transferred");
        }
        Commands::Discover {
            target,
            discovery_port,
        } => {
            let (agent, rpc_port) = discover(&target, discovery_port, Duration::from_secs(5)).await?;
            println!("{}:{rpc_port}", agent.ip());
        }
    }

    Ok(())
}
