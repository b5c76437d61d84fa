use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod extract;
mod fetch;
mod import;
mod repo;
mod server;

use repo::Repo;

#[derive(Parser)]
#[command(
    name = "stargate",
    version,
    about = "endpoint for retrieving with the stargate protocol"
)]
struct Cli {
    /// Repo directory.
    #[arg(long, env = "STARGATE_REPO", default_value = "~/.stargate", global = true)]
    repo: String,

    /// A global log level to use when printing logs. `RUST_LOG` takes
    /// priority when set.
    #[arg(long, global = true)]
    log_level: Option<tracing::Level>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the repo directory layout and index database.
    Init,

    /// Import a file or directory into the stargate.
    Import {
        #[clap(value_name = "PATH")]
        path: PathBuf,

        /// Chunk size for file leaves, in bytes.
        #[arg(long, default_value_t = stargate_castore::import::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Start a stargate HTTP server.
    Server {
        /// The port the web server listens on.
        #[arg(long, default_value_t = 7777)]
        port: u16,
    },

    /// Get something from a stargate server and extract it.
    Fetch {
        url: String,

        #[clap(value_name = "OUTPUT_DIR")]
        output_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level);
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(level: Option<tracing::Level>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            level
                .map(|level| level.to_string())
                .unwrap_or_else(|| "info".to_string()),
        )
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let repo = Repo::from_flag(&cli.repo)?;
    match cli.command {
        Commands::Init => {
            repo.ensure()?;
            repo.open_index()?;
            println!("Stargate activated!");
            Ok(())
        }
        Commands::Import { path, chunk_size } => import::run(&repo, &path, chunk_size).await,
        Commands::Server { port } => server::run(&repo, port).await,
        Commands::Fetch { url, output_dir } => fetch::run(&url, &output_dir).await,
    }
}
