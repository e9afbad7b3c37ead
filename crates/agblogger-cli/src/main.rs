//! `agb` — the agblogger sync client.

mod api;
mod syncer;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::api::{Api, CliError, CliResult};
use crate::syncer::Syncer;

#[derive(Parser, Debug)]
#[command(name = "agb", version)]
#[command(about = "Sync a local content directory with an agblogger server")]
struct Cli {
    /// Server base URL (e.g. https://blog.example.com)
    #[arg(long, env = "AGB_SERVER")]
    server: Option<String>,

    /// Personal access token; defaults to the stored credentials.
    #[arg(long, env = "AGB_TOKEN")]
    token: Option<String>,

    /// Local content directory.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a full sync session against the server.
    Sync {
        /// Show the plan without transferring anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Log in and store a personal access token for later syncs.
    Login {
        #[arg(long)]
        username: String,
        /// Read from AGB_PASSWORD to keep it off the process list.
        #[arg(long, env = "AGB_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Compare the working tree against the last synced state.
    Status,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredCredentials {
    server: Option<String>,
    token: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run() -> CliResult<()> {
    let cli = Cli::parse();
    let stored = load_credentials();
    let server = cli
        .server
        .or(stored.server.clone())
        .ok_or_else(|| CliError::Other(anyhow::anyhow!("no server configured; pass --server")))?;

    match cli.cmd {
        Commands::Login { username, password } => {
            let api = Api::new(&server, None)?;
            let access = api.login(&username, &password)?;
            let host = hostname_label(&server);
            let token = api.mint_pat(&access, &format!("agb on {host}"))?;
            save_credentials(&StoredCredentials {
                server: Some(server.clone()),
                token: Some(token),
            })?;
            println!("logged in to {server}; token stored");
            Ok(())
        }
        Commands::Sync { dry_run } => {
            let token = cli.token.or(stored.token).ok_or(CliError::Auth)?;
            let api = Api::new(&server, Some(token))?;
            let syncer = Syncer::new(api, &cli.dir)?;
            let report = syncer.sync(dry_run)?;

            println!(
                "uploaded {}, downloaded {}, deleted {}, merged {}",
                report.uploaded, report.downloaded, report.deleted_locally, report.merged
            );
            for path in &report.conflicts {
                println!("conflict: {path} (local copy in {path}.conflict-backup)");
            }
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            if !report.rejected_paths.is_empty() {
                return Err(CliError::PathSafety(report.rejected_paths.join(", ")));
            }
            Ok(())
        }
        Commands::Status => {
            let api = Api::new(&server, cli.token.or(stored.token))?;
            let syncer = Syncer::new(api, &cli.dir)?;
            let (added, modified, deleted) = syncer.status()?;
            for path in &added {
                println!("added:    {path}");
            }
            for path in &modified {
                println!("modified: {path}");
            }
            for path in &deleted {
                println!("deleted:  {path}");
            }
            if added.is_empty() && modified.is_empty() && deleted.is_empty() {
                println!("clean");
            }
            Ok(())
        }
    }
}

fn credentials_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("agblogger").join("credentials.json"))
}

fn load_credentials() -> StoredCredentials {
    let Some(path) = credentials_path() else {
        return StoredCredentials::default();
    };
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

fn save_credentials(credentials: &StoredCredentials) -> CliResult<()> {
    let path = credentials_path()
        .ok_or_else(|| CliError::Other(anyhow::anyhow!("no config directory available")))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))
            .map_err(CliError::Other)?;
    }
    let text = serde_json::to_string_pretty(credentials)
        .context("serialize credentials")
        .map_err(CliError::Other)?;
    std::fs::write(&path, text)
        .with_context(|| format!("write {}", path.display()))
        .map_err(CliError::Other)?;
    Ok(())
}

fn hostname_label(server: &str) -> String {
    server
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or(server)
        .to_string()
}
