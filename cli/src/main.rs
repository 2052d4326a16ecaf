//! nih - front end for nih instances
//!
//! Checks the trust bundle an instance would start with, and bootstraps a development one.

use std::{fs, path::PathBuf};

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use nih_trust::{Generator, TrustBundle};
use tracing::{Level, debug, info};

/// nih - instances of a system talking over mutually-authenticated QUIC
#[derive(Parser, Debug)]
#[command(name = "nih")]
#[command(version, about, long_about = None, disable_help_subcommand = true)]
struct Cli {
    /// TLS certificate chain file (leaf first)
    #[arg(long, global = true, default_value = "etc/trust/cert.pem")]
    cert: PathBuf,

    /// TLS private key file
    #[arg(long, global = true, default_value = "etc/trust/key.pem")]
    key: PathBuf,

    /// TLS CA certificate file
    #[arg(long, global = true, default_value = "etc/trust/ca.pem")]
    ca: PathBuf,

    /// More output; repeat for more
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print usage, or the usage of a command
    Help {
        /// Command to describe
        topic: Option<String>,
    },

    /// Load the trust bundle and describe its leaf
    Check,

    /// Generate a development root, intermediate, and leaf
    ///
    /// Nothing is written if a valid bundle already loads from the configured files.
    Generate {
        /// Overwrite a valid bundle
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        None => help(None),
        Some(Commands::Help { topic }) => help(topic.as_deref()),
        Some(Commands::Check) => check(&cli),
        Some(Commands::Generate { force }) => generate(&cli, *force),
    }
}

fn help(topic: Option<&str>) -> Result<()> {
    let mut cmd = Cli::command();
    match topic {
        None => cmd.print_long_help()?,
        Some(topic) => match cmd.find_subcommand_mut(topic) {
            Some(sub) => sub.print_long_help()?,
            None => bail!("nih help {topic}: unknown help topic. Run \"nih help\"."),
        },
    }

    Ok(())
}

fn load(cli: &Cli) -> Result<TrustBundle> {
    TrustBundle::load(&cli.cert, &cli.key, &cli.ca).context("load trust bundle")
}

fn check(cli: &Cli) -> Result<()> {
    let bundle = load(cli)?;
    let leaf = bundle.leaf();
    let serial: String = leaf.serial().iter().map(|b| format!("{b:02x}")).collect();

    println!("subject: {}", leaf.subject_name());
    println!("serial: {serial}");
    println!("expires: {}", leaf.not_after);
    println!("intermediates: {}", bundle.chain().len() - 1);
    println!("roots: {}", bundle.roots().len());
    Ok(())
}

fn generate(cli: &Cli, force: bool) -> Result<()> {
    if !force {
        match load(cli) {
            Ok(bundle) => {
                info!(leaf = bundle.leaf().subject_name(), "existing trust bundle is valid");
                println!("generate creds: OK (existing)");
                return Ok(());
            }
            Err(err) => debug!("{err:#}"),
        }
    }

    for path in [&cli.cert, &cli.key, &cli.ca] {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
    }

    let generator = Generator::new();
    let root = generator.root()?;
    let intermediate = generator.intermediate(&root)?;
    let leaf = generator.leaf(&intermediate)?;
    let bundle = TrustBundle::new(
        vec![
            leaf.certificate().clone(),
            intermediate.certificate().clone(),
        ],
        leaf.key().clone(),
        vec![root.certificate().clone()],
    )?;
    bundle
        .write(&cli.cert, &cli.key, &cli.ca)
        .context("write trust bundle")?;

    load(cli).context("reload generated trust bundle")?;
    println!("generate creds: OK");
    Ok(())
}
