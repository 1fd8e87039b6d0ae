//! dist-run - drive a distribution by hand.
//!
//! Provisions an installation, installs artifacts, starts it, waits for a
//! console pattern (or for exit) and stops it again. Useful for reproducing
//! a failing integration test outside the test runner.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use distribution_tests::{
    free_port, logging, patterns, ArtifactCoordinates, DistributionConfigBuilder, Installation,
    Run,
};

#[derive(Parser)]
#[command(name = "dist-run")]
#[command(about = "Provision, start and stop a server distribution under test")]
struct Cli {
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision an installation and run it
    Run {
        /// TOML configuration file (flags below override it)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Server version
        #[arg(long = "server-version")]
        server_version: Option<String>,

        /// Local artifact repository
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Reference distribution directory (skips repository lookup)
        #[arg(long)]
        home: Option<PathBuf>,

        /// Extra option forwarded as key=value
        #[arg(long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,

        /// Artifact to install, as COORDINATES=NAME
        #[arg(long = "install", value_name = "COORDS=NAME")]
        installs: Vec<String>,

        /// Console pattern signalling readiness; without it, wait for exit
        #[arg(long)]
        wait_for: Option<String>,

        /// Seconds to wait for the pattern or for exit
        #[arg(long, default_value_t = 10)]
        timeout: u64,

        /// Leave the server running after it became ready
        #[arg(long)]
        keep_running: bool,

        /// Delete the base directory afterwards
        #[arg(long)]
        cleanup: bool,

        /// Print a JSON summary instead of text
        #[arg(long)]
        json: bool,

        /// Arguments for the launcher
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Print where an artifact resolves in a repository
    Resolve {
        #[arg(long)]
        repo: PathBuf,

        coordinates: String,
    },

    /// Print a free local port
    Port,
}

#[derive(Serialize)]
struct RunSummary {
    base: PathBuf,
    pid: u32,
    args: Vec<String>,
    pattern: Option<String>,
    pattern_seen: Option<bool>,
    exited: bool,
    exit_code: Option<i32>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level)?;

    match cli.command {
        Commands::Run {
            config,
            server_version,
            repo,
            home,
            options,
            installs,
            wait_for,
            timeout,
            keep_running,
            cleanup,
            json,
            args,
        } => {
            let mut builder = match config {
                Some(path) => DistributionConfigBuilder::from_toml_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => DistributionConfigBuilder::new(),
            };
            if let Some(version) = server_version {
                builder = builder.server_version(&version);
            }
            if let Some(repo) = repo {
                builder = builder.repository_path(repo);
            }
            if let Some(home) = home {
                builder = builder.home(home);
            }
            for option in &options {
                let (key, value) = split_pair(option)?;
                builder = builder.option(key, value);
            }

            let installation = builder.build_installation()?;
            let summary = with_cleanup(installation, cleanup, |installation| {
                for install in &installs {
                    let (coordinates, name) = split_pair(install)?;
                    let dest = installation.install_artifact(coordinates, name)?;
                    if !json {
                        println!("{} {} -> {}", "installed".green(), coordinates, dest.display());
                    }
                }
                run_once(
                    installation,
                    &args,
                    wait_for.as_deref(),
                    Duration::from_secs(timeout),
                    keep_running,
                )
            })?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }

            let failed = summary.pattern_seen == Some(false)
                || (summary.pattern.is_none() && summary.exit_code != Some(0));
            if failed {
                bail!("distribution run did not succeed");
            }
            Ok(())
        }
        Commands::Resolve { repo, coordinates } => {
            let coordinates = ArtifactCoordinates::parse(&coordinates)?;
            let path = coordinates.resolve(&repo)?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Port => {
            println!("{}", free_port()?);
            Ok(())
        }
    }
}

/// Run `work` against the installation, deleting its base afterwards when
/// `cleanup` is set, whether or not `work` succeeded.
fn with_cleanup<T>(
    installation: Installation,
    cleanup: bool,
    work: impl FnOnce(&Installation) -> Result<T>,
) -> Result<T> {
    let outcome = work(&installation);
    if cleanup {
        installation.cleanup()?;
    }
    outcome
}

fn run_once(
    installation: &Installation,
    args: &[String],
    wait_for: Option<&str>,
    timeout: Duration,
    keep_running: bool,
) -> Result<RunSummary> {
    let run = installation.start(args)?;

    let pattern_seen = wait_for.map(|pattern| run.await_console_logs_for(pattern, timeout));
    match pattern_seen {
        Some(true) if keep_running => {
            println!(
                "{} pid {} in {} (Ctrl-C to stop)",
                "ready".green().bold(),
                run.pid(),
                installation.base().display()
            );
            while !run.await_exit(Duration::from_secs(3600)) {}
        }
        Some(_) => {
            run.stop()?;
            if !run.await_exit(Duration::from_secs(5)) {
                run.kill()?;
                run.await_exit(Duration::from_secs(5));
            }
        }
        None => {
            if !run.await_exit(timeout) {
                run.stop()?;
                run.await_exit(Duration::from_secs(5));
            }
        }
    }

    if pattern_seen == Some(false) {
        print_tail(&run);
    }

    Ok(RunSummary {
        base: installation.base().to_path_buf(),
        pid: run.pid(),
        args: run.args().to_vec(),
        pattern: wait_for.map(str::to_string),
        pattern_seen,
        exited: !run.is_alive(),
        exit_code: run.exit_code(),
    })
}

fn print_summary(summary: &RunSummary) {
    println!("{}", "--- Run Summary ---".bold());
    println!("base: {}", summary.base.display());
    println!("args: {}", summary.args.join(" "));
    if let (Some(pattern), Some(seen)) = (&summary.pattern, summary.pattern_seen) {
        let status = if seen {
            "SEEN".green().bold()
        } else {
            "NOT SEEN".red().bold()
        };
        println!("pattern {:?}: {}", pattern, status);
    }
    match summary.exit_code {
        Some(0) => println!("exit: {}", "0".green()),
        Some(code) => println!("exit: {}", code.to_string().yellow()),
        None => println!("exit: {}", "still running".red()),
    }
}

fn print_tail(run: &Run) {
    let output = run.output();
    if let Some(pattern) = patterns::startup_failure(&output) {
        eprintln!("{} {:?}", "startup failure:".red().bold(), pattern);
    }
    let logs = run.logs();
    let tail = logs.iter().rev().take(25).rev().cloned().collect::<Vec<_>>();
    eprintln!("{}", "Last output:".yellow());
    for line in tail {
        eprintln!("  {}", line);
    }
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    pair.split_once('=')
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got {:?}", pair))
}
