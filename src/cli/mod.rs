//! CLI module for Ambit.
//!
//! Subcommands:
//! - `check`: Validate the demo module and print its build order
//! - `run`: Run concurrent round scopes against the demo module

mod check;
pub mod demo;
mod run;

use clap::{Parser, Subcommand};

/// Ambit - scoped dependency resolution runtime
#[derive(Parser)]
#[command(name = "ambit")]
#[command(about = "Scoped dependency resolution runtime - demo and diagnostics")]
#[command(version)]
pub struct App {
    /// Run in verbose mode
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate the demo module graph and print it in build order
    Check {
        /// Print as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run concurrent rounds, each with its own round scope and a spawned task
    Run {
        /// Number of concurrent rounds
        #[arg(long, default_value = "3")]
        rounds: usize,
    },
}

impl App {
    /// Run the CLI application.
    pub async fn run(self) -> color_eyre::Result<()> {
        match self.command {
            Command::Check { json } => self.run_check(json).await,
            Command::Run { rounds } => self.run_rounds(rounds).await,
        }
    }
}
