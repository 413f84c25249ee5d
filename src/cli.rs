//! CLI surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::Result;

#[derive(Parser, Debug)]
#[command(name = "fswatchd", version, about = "Filesystem-observation daemon")]
pub struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Listening socket path override.
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon in the foreground.
    Run,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run => {
            let mut config = crate::config::load_or_default();
            if let Some(socket) = cli.socket {
                config.socket = Some(socket);
            }
            crate::daemon::run_daemon(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_flags() {
        let cli = parse_from(["fswatchd", "-vv", "--socket", "/tmp/x.sock", "run"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.socket.as_deref(), Some(std::path::Path::new("/tmp/x.sock")));
        assert!(matches!(cli.command, Command::Run));
    }
}
