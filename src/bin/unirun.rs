//! unirun - OCI-style Runtime CLI
//!
//! One lifecycle for native containers, host-managed containers and virtual
//! machines. Follows the OCI runtime CLI shape of runc/crun.
//!
//! ## Usage
//!
//! ```sh
//! unirun create <container-id> --image <ref> [--bundle <root>] [--runtime <kind>] [-- cmd args...]
//! unirun start <container-id>
//! unirun state <container-id>
//! unirun stop <container-id> [--signal TERM] [--timeout 30]
//! unirun kill <container-id> --signal <signal>
//! unirun delete <container-id> [--force]
//! unirun list
//! ```
//!
//! ## Runtime Selection
//!
//! By default the image reference picks the backend (`lxc/` and `db-`
//! prefixes go to managed containers, `vm-` to virtual machines, anything
//! else runs natively). Override with `--runtime native|managed|vm`.
//!
//! ## Exit Codes
//!
//! `0` on success, otherwise the error kind's stable code (see
//! `unirun::ErrorKind::exit_code`).

use clap::{Args, Parser, Subcommand};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use unirun::{
    Config, ContainerRequest, ContainerState, Error, LifecycleOrchestrator, MountRequest,
    NamespaceRequest, NetAlias, OCI_RUNTIME_SPEC_VERSION, ResourceLimits, Result, RuntimeKind,
    Signal,
};

// =============================================================================
// CLI Parsing
// =============================================================================

/// unirun - OCI-style runtime for containers and virtual machines
#[derive(Parser, Debug)]
#[command(name = "unirun")]
#[command(about = "Unified OCI-style lifecycle for native runtimes, managed containers and VMs")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Root of persisted container state
    #[arg(long, env = "UNIRUN_STATE_ROOT", global = true)]
    state_root: Option<PathBuf>,

    /// Root under which bundles are built
    #[arg(long, env = "UNIRUN_BUNDLE_ROOT", global = true)]
    bundle_root: Option<PathBuf>,

    /// Root of locally extracted images
    #[arg(long, env = "UNIRUN_IMAGE_ROOT", global = true)]
    image_root: Option<PathBuf>,

    /// Virtualization host node name
    #[arg(long, env = "UNIRUN_NODE", global = true)]
    node: Option<String>,

    /// Snapshot dataset template, `{id}` is replaced by the container id
    #[arg(long, env = "UNIRUN_SNAPSHOT_DATASET", global = true)]
    snapshot_dataset: Option<String>,

    /// Log filter (e.g. `info`, `unirun=debug`)
    #[arg(long, env = "UNIRUN_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a container
    Create(CreateArgs),

    /// Start a created container
    Start {
        /// Container ID
        id: String,
    },

    /// Stop a container, escalating to SIGKILL after the timeout
    Stop {
        /// Container ID
        id: String,

        /// Signal to send first
        #[arg(short, long, default_value = "TERM")]
        signal: String,

        /// Seconds to wait before escalating
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },

    /// Send a signal to a container
    Kill {
        /// Container ID
        id: String,

        /// Signal name or number
        #[arg(short, long)]
        signal: String,
    },

    /// Delete a container
    Delete {
        /// Container ID
        id: String,

        /// Kill a running container first and tolerate leftovers
        #[arg(short, long)]
        force: bool,
    },

    /// Query container state (JSON)
    State {
        /// Container ID
        id: String,
    },

    /// List containers
    List,

    /// Update resource limits
    Update {
        /// Container ID
        id: String,

        /// Memory limit in bytes
        #[arg(long)]
        memory: Option<u64>,

        /// CPU shares (1024 = one core)
        #[arg(long)]
        cpu_shares: Option<u64>,
    },

    /// Snapshot a created or stopped container's storage
    Checkpoint {
        /// Container ID
        id: String,

        /// Snapshot name (default: timestamped)
        #[arg(long)]
        name: Option<String>,
    },

    /// Roll a created or stopped container back to a snapshot
    Rollback {
        /// Container ID
        id: String,

        /// Snapshot name (default: newest)
        #[arg(long)]
        name: Option<String>,
    },

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// Container ID
    id: String,

    /// Image reference
    #[arg(short, long)]
    image: String,

    /// Bundle root; the bundle is built at `<bundle>/<id>`
    #[arg(short, long)]
    bundle: Option<PathBuf>,

    /// Runtime override (native, managed, vm)
    #[arg(short, long)]
    runtime: Option<String>,

    /// Memory limit in bytes
    #[arg(long)]
    memory: Option<u64>,

    /// CPU shares (1024 = one core)
    #[arg(long)]
    cpu_shares: Option<u64>,

    /// Environment variable (KEY=VALUE), repeatable
    #[arg(short, long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Bind mount (src:dst[:ro|rw]), repeatable
    #[arg(short, long = "mount")]
    mount: Vec<MountRequest>,

    /// Additional namespace (user, cgroup), repeatable
    #[arg(long = "namespace")]
    namespace: Vec<NamespaceRequest>,

    /// Network device alias (name:bridge), repeatable
    #[arg(long = "net")]
    net: Vec<NetAlias>,

    /// NUMA placement policy
    #[arg(long)]
    numa: Option<String>,

    /// RDT profile
    #[arg(long)]
    rdt: Option<String>,

    /// Working directory
    #[arg(long)]
    cwd: Option<String>,

    /// User as uid[:gid]
    #[arg(short, long, value_parser = parse_user)]
    user: Option<(u32, Option<u32>)>,

    /// Hostname (defaults to the container ID)
    #[arg(long)]
    hostname: Option<String>,

    /// Mount the root filesystem read-only
    #[arg(long)]
    readonly: bool,

    /// Command and arguments
    #[arg(last = true)]
    command: Vec<String>,
}

fn parse_env(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn parse_user(s: &str) -> std::result::Result<(u32, Option<u32>), String> {
    let parse = |part: &str| {
        part.parse::<u32>()
            .map_err(|_| format!("expected uid[:gid], got '{s}'"))
    };
    match s.split_once(':') {
        Some((uid, gid)) => Ok((parse(uid)?, Some(parse(gid)?))),
        None => Ok((parse(s)?, None)),
    }
}

impl CreateArgs {
    fn into_request(self) -> ContainerRequest {
        let (uid, gid) = match self.user {
            Some((uid, gid)) => (Some(uid), gid),
            None => (None, None),
        };
        ContainerRequest {
            id: self.id,
            image: self.image,
            command: self.command,
            args: Vec::new(),
            env: self.env.into_iter().collect::<BTreeMap<_, _>>(),
            mounts: self.mount,
            resources: ResourceLimits {
                memory_bytes: self.memory,
                cpu_shares: self.cpu_shares,
            },
            namespaces: self.namespace.into_iter().collect::<BTreeSet<_>>(),
            net_aliases: self.net,
            numa_policy: self.numa,
            rdt_profile: self.rdt,
            runtime: self.runtime,
            cwd: self.cwd,
            uid,
            gid,
            hostname: self.hostname,
            readonly_rootfs: self.readonly,
        }
    }
}

// =============================================================================
// Setup
// =============================================================================

fn init_logging(level: Option<&str>) {
    let filter = level
        .and_then(|l| EnvFilter::try_new(l).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(cli: &Cli, bundle_override: Option<&PathBuf>) -> Config {
    let mut config = Config::default();
    if let Some(path) = &cli.state_root {
        config = config.with_state_root(path);
    }
    if let Some(path) = bundle_override.or(cli.bundle_root.as_ref()) {
        config = config.with_bundle_root(path);
    }
    if let Some(path) = &cli.image_root {
        config = config.with_image_root(path);
    }
    if let Some(node) = &cli.node {
        config = config.with_node(node);
    }
    if let Some(template) = &cli.snapshot_dataset {
        config = config.with_snapshot_dataset(template);
    }
    config
}

// =============================================================================
// Command Implementations
// =============================================================================

fn print_state(state: &ContainerState) -> Result<()> {
    let json = serde_json::to_string_pretty(&state.to_document())?;
    println!("{json}");
    Ok(())
}

fn cmd_list(orchestrator: &LifecycleOrchestrator) -> Result<()> {
    println!("ID\tSTATUS\tPID\tRUNTIME\tBUNDLE");
    for state in orchestrator.list()? {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            state.id,
            state.status,
            state.pid,
            state.runtime_kind,
            state.bundle.display()
        );
    }
    Ok(())
}

fn cmd_version() {
    println!("unirun version {}", env!("CARGO_PKG_VERSION"));
    println!("spec: {OCI_RUNTIME_SPEC_VERSION}");
    let backends: Vec<&str> = RuntimeKind::compiled_in()
        .into_iter()
        .map(RuntimeKind::as_str)
        .collect();
    println!("backends: {}", backends.join(", "));
}

async fn run(cli: Cli) -> Result<()> {
    let bundle_override = match &cli.command {
        Command::Create(args) => args.bundle.clone(),
        _ => None,
    };
    let config = build_config(&cli, bundle_override.as_ref());

    if let Command::Version = cli.command {
        cmd_version();
        return Ok(());
    }

    let orchestrator = LifecycleOrchestrator::from_config(config)?;

    match cli.command {
        Command::Create(args) => {
            let state = orchestrator.create(&args.into_request()).await?;
            eprintln!("Created container {} ({})", state.id, state.runtime_kind);
        }
        Command::Start { id } => {
            let state = orchestrator.start(&id).await?;
            eprintln!("Started container {} (pid {})", id, state.pid);
        }
        Command::Stop {
            id,
            signal,
            timeout,
        } => {
            let signal: Signal = signal.parse()?;
            let state = orchestrator
                .stop(&id, signal, Duration::from_secs(timeout))
                .await?;
            eprintln!("Container {} is {}", id, state.status);
        }
        Command::Kill { id, signal } => {
            let signal: Signal = signal.parse()?;
            let state = orchestrator.kill(&id, signal).await?;
            eprintln!("Sent {} to container {} (now {})", signal, id, state.status);
        }
        Command::Delete { id, force } => {
            orchestrator.delete(&id, force).await?;
            eprintln!("Deleted container {id}");
        }
        Command::State { id } => print_state(&orchestrator.state(&id)?)?,
        Command::List => cmd_list(&orchestrator)?,
        Command::Update {
            id,
            memory,
            cpu_shares,
        } => {
            let resources = ResourceLimits {
                memory_bytes: memory,
                cpu_shares,
            };
            orchestrator.update(&id, &resources).await?;
            eprintln!("Updated container {id}");
        }
        Command::Checkpoint { id, name } => {
            let handle = orchestrator.checkpoint(&id, name.as_deref()).await?;
            println!("{handle}");
        }
        Command::Rollback { id, name } => {
            let handle = orchestrator.rollback(&id, name.as_deref()).await?;
            println!("{handle}");
        }
        Command::Version => cmd_version(),
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::from(Error::Io(e).exit_code());
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            if let Some(stderr) = e.stderr_excerpt() {
                tracing::debug!("backend stderr: {}", stderr);
            }
            ExitCode::from(e.exit_code())
        }
    }
}
