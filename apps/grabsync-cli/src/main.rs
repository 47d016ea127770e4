mod scenario;

use clap::{Args, Parser, Subcommand};
use grabsync_common::ParticipantId;
use grabsync_kernel::SyncConfig;
use grabsync_persist::{SessionSnapshot, SnapshotStore};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use scenario::ScenarioParams;

#[derive(Parser)]
#[command(name = "grabsync-cli", about = "CLI tool for grabsync sessions")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// YAML config with archetypes and possession tuning
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    /// Participants at the start of the session
    #[arg(short, long, default_value = "3")]
    participants: u32,
    /// Objects spawned by the first participant
    #[arg(short, long, default_value = "8")]
    objects: u32,
    /// Frames to simulate at 60 Hz
    #[arg(short, long, default_value = "900")]
    frames: u64,
    /// Seed for the scripted hand motion
    #[arg(short, long, default_value = "42")]
    seed: u64,
}

impl SimulateArgs {
    fn params(&self) -> ScenarioParams {
        ScenarioParams {
            participants: self.participants,
            objects: self.objects,
            frames: self.frames,
            seed: self.seed,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as YAML
    Config,
    /// Run a scripted loopback session and compare replicas
    Simulate(SimulateArgs),
    /// Run a scripted session and store the authority's state
    Export {
        #[command(flatten)]
        sim: SimulateArgs,
        /// Snapshot store directory
        #[arg(long)]
        out: PathBuf,
    },
    /// Verify a snapshot store and describe a snapshot
    Inspect {
        /// Snapshot store directory
        store: PathBuf,
        /// Snapshot index (defaults to the latest)
        #[arg(short, long)]
        index: Option<u32>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };

    match cli.command {
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Commands::Simulate(sim) => {
            println!(
                "Simulating: participants={}, objects={}, frames={}, seed={}",
                sim.participants, sim.objects, sim.frames, sim.seed
            );
            let (session, report) = scenario::run(config, &sim.params())?;
            println!(
                "Grabs: {}, releases: {}, log entries: {}",
                report.grabs, report.releases, report.log_len
            );
            for p in &report.left {
                println!("Left mid-session: {p}");
            }
            for p in &report.joined_late {
                println!("Joined late: {p}");
            }
            for (p, hash) in session.state_hashes() {
                println!("  {p}: {hash:#018x}");
            }
            let converged = session.converged();
            println!("Match: {}", if converged { "OK" } else { "MISMATCH" });
            if !converged {
                anyhow::bail!("replicas diverged");
            }
        }
        Commands::Export { sim, out } => {
            let (session, report) = scenario::run(config, &sim.params())?;
            let authority = session
                .hub()
                .authority()
                .unwrap_or(ParticipantId(1));
            let gateway = session
                .gateway(authority)
                .ok_or_else(|| anyhow::anyhow!("no authority left in the session"))?;
            let snapshot = SessionSnapshot::capture(gateway.registry())?;
            let mut store = SnapshotStore::open(&out)?;
            let index = store.save(&snapshot)?;
            println!(
                "Exported snapshot {index} from {authority} after {} log entries to {}",
                report.log_len,
                out.display()
            );
            print!("{}", snapshot.summary());
        }
        Commands::Inspect { store, index } => {
            let store = SnapshotStore::open(&store)?;
            store.verify_integrity()?;
            println!(
                "Store: {} (schema v{}, {} snapshots), integrity OK",
                store.root().display(),
                store.meta().snapshot_schema_version,
                store.meta().snapshot_count
            );
            let snapshot = match index {
                Some(i) => store.load(i)?,
                None => store.load_latest()?,
            };
            print!("{}", snapshot.summary());
            for record in &snapshot.state.records {
                let holder = record
                    .holder()
                    .map_or_else(|| "-".to_string(), |p| p.to_string());
                let p = record.pose.position;
                println!(
                    "  {} archetype={} pos=({:.2}, {:.2}, {:.2}) holder={} attached={}",
                    record.id,
                    record.archetype.0,
                    p.x,
                    p.y,
                    p.z,
                    holder,
                    record.is_attached()
                );
            }
        }
    }

    Ok(())
}
