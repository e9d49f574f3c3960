use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use rpsmanager::auth::{Operation, RoleTable};
use rpsmanager::cgroup::CgroupController;
use rpsmanager::config::{AttachMode, RunAs, WorkerConfig};
use rpsmanager::jobs::Job;
use rpsmanager::JobManager;

#[derive(Parser, Debug)]
#[command(name = "rpsmanager")]
#[command(version)]
#[command(about = "Run Linux processes under per-job cgroup v2 limits")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a command as a job, stream its output and print its final status
    Run {
        #[command(flatten)]
        worker: WorkerArgs,

        /// Role table (JSON) used to authorize --identity
        #[arg(long, requires = "identity")]
        roles: Option<PathBuf>,

        /// Caller identity checked against --roles
        #[arg(long)]
        identity: Option<String>,

        /// Output format for the final status
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        /// The command to execute (e.g., "echo hello")
        command: String,
    },

    /// Check that the cgroup root can be set up on this host
    Check {
        #[command(flatten)]
        worker: WorkerArgs,
    },
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Root control group for job groups
    #[arg(long, default_value = "/sys/fs/cgroup/rpsmanager")]
    cgroup_root: PathBuf,

    /// Directory for job output files
    #[arg(long, default_value = "/var/lib/rpsmanager/output")]
    output_dir: PathBuf,

    /// Directory listing block devices for io.max
    #[arg(long, default_value = "/sys/block")]
    block_devices_dir: PathBuf,

    /// Output poll interval in milliseconds
    #[arg(long, default_value = "200")]
    poll_interval_ms: u64,

    /// Seconds between SIGTERM and SIGKILL when stopping a job
    #[arg(long, default_value = "10")]
    grace_secs: u64,

    /// How the child is placed into its cgroup
    #[arg(long, default_value = "at-spawn")]
    attach_mode: AttachModeArg,

    /// Run the job as this uid (requires --gid)
    #[arg(long, requires = "gid")]
    uid: Option<u32>,

    /// Run the job as this gid (requires --uid)
    #[arg(long, requires = "uid")]
    gid: Option<u32>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum AttachModeArg {
    AtSpawn,
    AfterSpawn,
}

impl WorkerArgs {
    fn into_config(self) -> WorkerConfig {
        let mode = match self.attach_mode {
            AttachModeArg::AtSpawn => AttachMode::AtSpawn,
            AttachModeArg::AfterSpawn => AttachMode::AfterSpawn,
        };
        let mut config = WorkerConfig::new(self.cgroup_root, self.output_dir)
            .with_block_devices_dir(self.block_devices_dir)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_stop_grace_period(Duration::from_secs(self.grace_secs))
            .with_attach_mode(mode);
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            config = config.with_run_as(RunAs { uid, gid });
        }
        config
    }
}

fn init_tracing() {
    // Job output goes to stdout, logs to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run_job(
    worker: WorkerArgs,
    roles: Option<PathBuf>,
    identity: Option<String>,
    format: OutputFormat,
    command: String,
) -> Result<Job, Box<dyn std::error::Error>> {
    if let (Some(path), Some(identity)) = (roles, identity) {
        let table = RoleTable::load(&path).await?;
        table.authorize(&identity, Operation::StartJob)?;
        table.authorize(&identity, Operation::StreamJobOutput)?;
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let manager = JobManager::init(worker.into_config())?;
    let job_id = manager.start_job(&command).await?;
    tracing::info!(job_id = %job_id, "Job started");

    let mut output = manager.stream_job_output(&job_id).await?;
    let mut stdout = tokio::io::stdout();
    let mut stopping = false;

    loop {
        tokio::select! {
            chunk = output.next() => match chunk {
                Some(Ok(bytes)) => {
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
                Some(Err(e)) => {
                    tracing::error!(job_id = %job_id, error = %e, "Output stream failed");
                    break;
                }
                None => break,
            },
            // Keep draining output until the stopped job's stream ends.
            _ = sigint.recv(), if !stopping => {
                stopping = true;
                let status = manager.stop_job(&job_id).await?;
                tracing::info!(job_id = %job_id, %status, "Received SIGINT, stopping job");
            }
            _ = sigterm.recv(), if !stopping => {
                stopping = true;
                let status = manager.stop_job(&job_id).await?;
                tracing::info!(job_id = %job_id, %status, "Received SIGTERM, stopping job");
            }
        }
    }

    let job = manager.wait_for_exit(&job_id).await?;
    print_job(&job, &format)?;
    Ok(job)
}

fn print_job(job: &Job, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            eprintln!("{}", serde_json::to_string_pretty(job)?);
        }
        OutputFormat::Table => {
            eprintln!("Job ID:     {}", job.id);
            eprintln!("Command:    {}", job.command);
            eprintln!("Status:     {}", job.status);
            eprintln!("Exit code:  {}", job.exit_code);
            if let Some(signal) = job.term_signal {
                eprintln!("Signal:     {}", signal);
            }
            if let Some(start) = job.start_time {
                eprintln!("Started:    {}", start.format("%Y-%m-%d %H:%M:%S%.3f UTC"));
            }
            if let Some(stop) = job.stop_time {
                eprintln!("Stopped:    {}", stop.format("%Y-%m-%d %H:%M:%S%.3f UTC"));
            }
            if let Some(error) = &job.error {
                eprintln!("Error:      {} ({})", error.code, error.message);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Run {
            worker,
            roles,
            identity,
            output,
            command,
        } => {
            let job = run_job(worker, roles, identity, output, command).await?;
            if job.error.is_some() {
                std::process::exit(1);
            }
        }
        Commands::Check { worker } => {
            let config = worker.into_config();
            let controller = CgroupController::init(&config)?;
            let devices = controller.block_devices()?;
            println!("Cgroup root:   {}", controller.root().display());
            let devices: Vec<String> = devices
                .iter()
                .map(|(major, minor)| format!("{}:{}", major, minor))
                .collect();
            println!("Block devices: {}", devices.join(" "));
        }
    }

    Ok(())
}
