use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "edocebiv")]
#[command(version, about = "Project workspaces with Docker containers and LLM reasoning")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = edocebiv::config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Port to serve on (overrides the configuration)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS for a separately served frontend)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and its tables
    InitDb,
    /// Create a user and print their API token
    CreateUser { username: String },
    /// Replace a user's API token and print the new one
    RotateToken { username: String },
    /// Print the effective configuration
    Config,
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("EDOCEBIV_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = edocebiv::config::Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve { port, dev } => cmd::cmd_serve(config, port, dev).await?,
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::CreateUser { username } => cmd::cmd_create_user(&config, &username)?,
        Commands::RotateToken { username } => cmd::cmd_rotate_token(&config, &username)?,
        Commands::Config => cmd::cmd_config(&cli.config, &config)?,
    }

    Ok(())
}
