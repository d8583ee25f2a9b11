use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;

mod check;
mod replay;
mod session;

const ENV_LOG: &str = "HOSTBIND_LOG";

#[derive(Parser, Debug)]
#[command(name = "hostbind")]
#[command(about = "Object lifetime and ownership checks for native bindings.", long_about = None)]
#[command(version)]
struct Cli {
    /// Log more (repeat for debug and trace). Overrides HOSTBIND_LOG.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Validate a descriptor table and print a check report.
    Check(check::CheckArgs),
    /// Replay a session script against a simulated native heap.
    Replay(replay::ReplayArgs),
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Command::Check(args) => check::cmd_check(args),
        Command::Replay(args) => replay::cmd_replay(args),
    }
}

fn log_level(verbose: u8, env: Option<&str>) -> Result<Level> {
    match (verbose, env) {
        (0, Some(v)) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{ENV_LOG}: invalid log level {v:?}")),
        (0, _) => Ok(Level::WARN),
        (1, _) => Ok(Level::INFO),
        (2, _) => Ok(Level::DEBUG),
        _ => Ok(Level::TRACE),
    }
}

fn init_tracing(verbose: u8) -> Result<()> {
    let env = std::env::var(ENV_LOG).ok();
    let level = log_level(verbose, env.as_deref())?;
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .finish(),
    )
    .context("install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_wins_over_env() {
        assert_eq!(log_level(0, None).unwrap(), Level::WARN);
        assert_eq!(log_level(0, Some("debug")).unwrap(), Level::DEBUG);
        assert_eq!(log_level(2, Some("error")).unwrap(), Level::DEBUG);
        assert_eq!(log_level(5, None).unwrap(), Level::TRACE);
        assert!(log_level(0, Some("loud")).is_err());
    }
}
