//! clyde - package manager and build orchestrator CLI.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use clyde::cache::BuildCache;
use clyde::cmd;
use clyde::hooks::{BuildEvent, HookBus};
use clyde::ops::Context;
use clyde::registry::{DirectoryRegistry, InMemoryRegistry, Registry};
use clyde::toolchain::gcc::GccDriver;

#[derive(Parser)]
#[command(name = "clyde")]
#[command(author, version, about = "Package manager and build orchestrator for C/C++")]
struct Cli {
    /// Package root (defaults to the current directory)
    #[arg(long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Registry directory of tarballs (<name>/<version>.tar.gz)
    #[arg(long, global = true, env = "CLYDE_REGISTRY")]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve, plan and build the package
    Build {
        /// Worker pool size (defaults to hardware concurrency)
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Stop scheduling new steps after the first failure
        #[arg(long)]
        fail_fast: bool,
        /// Per-step timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Build trait key=value, repeatable
        #[arg(long = "trait", value_name = "KEY=VALUE")]
        traits: Vec<String>,
    },
    /// Resolve the dependency graph without building
    Resolve {
        /// Write the graph as JSON to this file
        #[arg(long)]
        graph_out: Option<PathBuf>,
    },
    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached objects and artifacts
    List,
    /// Remove every cache entry
    Clean,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(()) => clyde::ops::exit_code::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), clyde::ops::Error> {
    let cache = Arc::new(BuildCache::open(clyde::cache_root())?);
    let registry: Arc<dyn Registry> = match &cli.registry {
        Some(dir) => Arc::new(DirectoryRegistry::new(dir.clone())),
        None => Arc::new(InMemoryRegistry::new()),
    };
    let driver = Arc::new(GccDriver::default());
    let mut bus = HookBus::new();
    bus.subscribe("progress", false, progress_reporter);
    let ctx = Context::new(registry, driver, cache.clone(), Arc::new(bus));

    match cli.command {
        Commands::Build {
            jobs,
            fail_fast,
            timeout,
            traits,
        } => cmd::build::build(&ctx, cli.dir, jobs, fail_fast, timeout, &traits).await,
        Commands::Resolve { graph_out } => {
            cmd::graph::resolve(&ctx, cli.dir, graph_out.as_deref())
        }
        Commands::Cache { command } => match command {
            CacheCommands::List => cmd::cache::list(&cache),
            CacheCommands::Clean => cmd::cache::clean(&cache),
        },
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Per-step progress lines, driven off the event stream like any other
/// subscriber.
fn progress_reporter(event: &BuildEvent) -> anyhow::Result<()> {
    match event {
        BuildEvent::PackageFetched { package } => {
            println!("  fetched {package}");
        }
        BuildEvent::PostCompile {
            package,
            success: true,
            cache_hit,
            duration,
            ..
        } => {
            if *cache_hit {
                println!("  cc {package} (cached)");
            } else {
                println!("  cc {package} ({:.1}ms)", duration.as_secs_f64() * 1000.0);
            }
        }
        BuildEvent::PostLink {
            package,
            success: true,
            cache_hit,
            ..
        } => {
            if *cache_hit {
                println!("  ld {package} (cached)");
            } else {
                println!("  ld {package}");
            }
        }
        _ => {}
    }
    Ok(())
}
