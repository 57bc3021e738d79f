//! kdbx-inspect - Open a KeePass 2.x database and report what it holds
//!
//! Prints a JSON summary (name, format parameters, entry and group counts,
//! integrity status). Secrets are never printed.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use kdbx_core::{CompositeKey, Database, DatabaseMetadata, KeyFromFile, Zeroizing};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "kdbx-inspect")]
#[command(version, about = "Open a KeePass 2.x database and print a summary of what it holds.")]
struct Cli {
    /// Path to the .kdbx file
    file: PathBuf,

    /// Key file to combine with the password
    #[arg(long, value_name = "PATH")]
    key_file: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH", env = "KDBX_INSPECT_CONFIG")]
    config: Option<PathBuf>,

    /// Keep reading past corrupted blocks and report them instead of failing
    #[arg(long, default_value_t = false)]
    best_effort: bool,

    /// The database is locked by a key file only
    #[arg(long, default_value_t = false)]
    no_password: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    file: PathBuf,
    #[serde(flatten)]
    metadata: DatabaseMetadata,
    faults: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kdbx_inspect=info,kdbx_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let mut options = config.decrypt.clone();
    if cli.best_effort {
        options.stop_on_error = false;
    }

    let key = composite_key(&cli, &config)?;
    let db = Database::open_path(&cli.file, &key, &options)
        .with_context(|| format!("cannot open {}", cli.file.display()))?;

    if db.is_corrupted() {
        tracing::warn!("{} has {} damaged block(s)", cli.file.display(), db.faults().len());
    }

    let report = Report {
        file: cli.file.clone(),
        metadata: db.metadata(),
        faults: db.faults().iter().map(|f| f.to_string()).collect(),
    };
    let json = if config.output.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", json);

    Ok(())
}

/// Password first, then key file, as KeePass combines them
fn composite_key(cli: &Cli, config: &Config) -> Result<CompositeKey> {
    let password = if cli.no_password {
        None
    } else {
        Some(read_password(&config.keys.password_env)?)
    };

    let key_file = match cli.key_file.as_ref().or(config.keys.key_file.as_ref()) {
        Some(path) => {
            let content = Zeroizing::new(
                std::fs::read(path)
                    .with_context(|| format!("cannot read key file {}", path.display()))?,
            );
            let key = KeyFromFile::try_new(&content)
                .with_context(|| format!("unrecognized key file {}", path.display()))?;
            Some(key)
        }
        None => None,
    };

    if password.is_none() && key_file.is_none() {
        anyhow::bail!("no credentials: pass a key file or drop --no-password");
    }

    Ok(CompositeKey::from_credentials(
        password.as_deref().map(|p| p.as_str()),
        key_file.as_ref(),
    )?)
}

fn read_password(env_name: &str) -> Result<Zeroizing<String>> {
    if let Ok(password) = std::env::var(env_name) {
        tracing::debug!("Using password from ${}", env_name);
        return Ok(Zeroizing::new(password));
    }

    let password = rpassword::prompt_password("Password: ").context("cannot read password")?;
    Ok(Zeroizing::new(password))
}
