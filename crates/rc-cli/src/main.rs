//! Resource Classification CLI
//!
//! Replays host event scenarios through the classification dispatcher and
//! checks dispatch latency under load.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod error;
mod replay;
mod scenario;
mod stress;

use replay::{run_replay, ReplayOptions};
use stress::{run_stress, StressOptions};

#[derive(Parser)]
#[command(name = "rc-cli")]
#[command(about = "Resource classification dispatch tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario file and print outcomes as JSON lines
    Replay {
        /// Scenario JSON file
        #[arg(short, long)]
        scenario: PathBuf,

        /// Dispatcher config JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Fire synthetic requests concurrently and check latency budgets
    Stress {
        /// Number of requests
        #[arg(short, long, default_value_t = 10_000)]
        requests: usize,

        /// Number of frames the requests are spread over
        #[arg(short, long, default_value_t = 16)]
        frames: usize,

        /// Dispatcher config JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Replay { scenario, config } => {
            run_replay(ReplayOptions { scenario, config }).await
        }
        Commands::Stress {
            requests,
            frames,
            config,
        } => {
            run_stress(StressOptions {
                requests,
                frames,
                config,
            })
            .await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
