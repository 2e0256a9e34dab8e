use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Arguments {
    #[command(subcommand)]
    pub command: Command,
    /// Enable debug logging.
    ///
    /// - Level 1 enables DEBUG.
    /// - Level 2 and up enables TRACE.
    #[clap(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Shorthand for `--verbose`.
    #[arg(long, default_value_t = false, global = true)]
    pub debug: bool,
}

impl Arguments {
    pub fn exec_allowed(&self) -> bool {
        match self.command {
            Command::Serve { allow_exec, .. } => allow_exec,
            _ => false,
        }
    }

    pub fn operator(&self) -> Option<&str> {
        match &self.command {
            Command::Serve { operator, .. } => operator.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve a site directory as a live application.
    Serve {
        /// The site root (the directory holding `tinkerdown.yaml`).
        dir: PathBuf,
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1")]
        addr: String,
        /// Port to bind.
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
        /// Permit `exec` sources and `exec` actions to run subprocesses.
        #[arg(long, default_value_t = false)]
        allow_exec: bool,
        /// Identity string surfaced to templates as `.Operator` and to
        /// computed-source filters as the `operator` identifier.
        #[arg(long)]
        operator: Option<String>,
    },
    /// Produce a standalone binary embedding the site.
    Build {
        /// The site root or a single page file.
        dir: PathBuf,
        /// Output path for the produced binary.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Target triple hint (`GOOS/GOARCH`-style pairs are accepted and mapped).
        #[arg(long)]
        target: Option<String>,
    },
    /// Scaffold a new site.
    New {
        /// Directory to create.
        dir: PathBuf,
        /// Scaffold flavour.
        #[arg(long, default_value = "basic")]
        template: String,
    },
    /// Parse every page in a site and report structured errors.
    Validate {
        /// The site root.
        dir: PathBuf,
    },
}
