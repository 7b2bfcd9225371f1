//! dmerge: client for the dmerge branch-deconfliction service.
//!
//! Computes the minimal set of version-control objects describing the
//! divergence between two branches, uploads it as a single pack, and
//! applies the server's streamed instructions.
//!
//! # Usage
//!
//! ```bash
//! # Store a token and verify it
//! dmerge auth <token>
//!
//! # Merge origin/main into the current branch
//! dmerge merge origin/main
//!
//! # Rebase the current branch onto its upstream
//! dmerge rebase
//!
//! # Inspect or change configuration
//! dmerge config server https://dmerge.example.com
//! ```

mod config;
mod deconflict;

use anyhow::Result;
use clap::{Parser, Subcommand};

use config::{Config, TOKEN_KEY};

#[derive(Parser, Debug)]
#[command(name = "dmerge")]
#[command(author = "DMerge Contributors")]
#[command(version = "0.1.0")]
#[command(about = "DMerge deconfliction service client")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Merge <main> into the current branch via the deconfliction service
    Merge {
        /// Main branch; defaults to the current branch's upstream
        main: Option<String>,
    },

    /// Rebase the current branch onto <main> via the deconfliction service
    Rebase {
        /// Main branch; defaults to the topic branch's upstream
        main: Option<String>,
        /// Topic branch; defaults to the current branch
        topic: Option<String>,
    },

    /// Store and verify the service token
    Auth {
        /// Token to store; omit to re-check the stored one
        token: Option<String>,
    },

    /// Get/set config values (low level, for debugging/development)
    Config {
        key: Option<String>,
        value: Option<String>,
    },

    /// Print version information and exit
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dmerge_core=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => cmd_root().await,

        Some(Commands::Merge { main }) => cmd_deconflict("merge", main, None).await,

        Some(Commands::Rebase { main, topic }) => cmd_deconflict("rebase", main, topic).await,

        Some(Commands::Auth { token }) => cmd_auth(token).await,

        Some(Commands::Config { key, value }) => cmd_config(key, value),

        Some(Commands::Version) => cmd_version(),
    }
}

async fn cmd_root() -> Result<()> {
    let cfg = Config::load_default()?;
    let git = deconflict::make_toolchain(&cfg);
    let client = deconflict::make_client(&cfg, &git);
    let mut stream = client.root().await?;
    deconflict::drain(&git, &mut stream, false).await
}

async fn cmd_deconflict(verb: &str, main: Option<String>, topic: Option<String>) -> Result<()> {
    let cfg = Config::load_default()?;
    deconflict::run(&cfg, verb, main, topic).await
}

async fn cmd_auth(token: Option<String>) -> Result<()> {
    let mut cfg = Config::load_default()?;

    if let Some(tok) = token {
        cfg.set(TOKEN_KEY, &tok)?;
        println!("token stored");
    }

    let git = deconflict::make_toolchain(&cfg);
    let client = deconflict::make_client(&cfg, &git);
    let mut stream = client.check_auth().await?;
    deconflict::drain(&git, &mut stream, false).await
}

fn cmd_config(key: Option<String>, value: Option<String>) -> Result<()> {
    let mut cfg = Config::load_default()?;
    match (key, value) {
        (None, _) => {
            for (k, v) in cfg.values() {
                println!("{}: {}", k, v);
            }
        }
        (Some(k), None) => println!("{}", cfg.get(&k)),
        (Some(k), Some(v)) => cfg.set(&k, &v)?,
    }
    Ok(())
}

fn cmd_version() -> Result<()> {
    let cfg = Config::load_default()?;
    let git = deconflict::make_toolchain(&cfg);

    println!("dmerge version {}", env!("CARGO_PKG_VERSION"));
    if let Ok(git_version) = git.version() {
        println!("{}", git_version);
    }
    Ok(())
}
