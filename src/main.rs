//! `casare-robot` entry point.

use casare_robot::cli::{handle_start, handle_status, handle_stop, Cli, Commands};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Start {
            config,
            robot_id,
            verbose,
        } => handle_start(config, robot_id, verbose).await,
        Commands::Stop { robot_id, force } => handle_stop(&robot_id, force),
        Commands::Status { robot_id, json } => handle_status(robot_id, json),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    }
}
