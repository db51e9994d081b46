#![allow(clippy::multiple_crate_versions)]

use clap::{Arg, ArgAction, Command};

mod commands;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let matches = Command::new("seraph")
        .version(VERSION)
        .about("Sentinel - autonomous SRE log-triage and investigation agent")
        .subcommand(
            Command::new("up")
                .about("Start the agent: ingress, triage, scheduler and investigation workers")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("Path to seraph.config.json (defaults to ./seraph.config.json)"),
                ),
        )
        .subcommand(Command::new("doctor").about("Check configuration and environment health"))
        .subcommand(
            Command::new("logs")
                .about("Show recently ingested logs via the local socket")
                .arg(
                    Arg::new("follow")
                        .short('f')
                        .long("follow")
                        .action(ArgAction::SetTrue)
                        .help("Poll for new logs in real-time"),
                )
                .arg(
                    Arg::new("lines")
                        .short('n')
                        .long("lines")
                        .value_name("LINES")
                        .help("Number of recent log lines to show")
                        .default_value("50"),
                ),
        )
        .subcommand(Command::new("status").about("Show the running agent's health and worker counts"))
        .get_matches();

    match matches.subcommand() {
        Some(("up", sub_matches)) => {
            commands::up::run(sub_matches).await;
        }
        Some(("doctor", _sub_matches)) => {
            commands::doctor::run().await;
        }
        Some(("logs", sub_matches)) => {
            commands::logs::run(sub_matches).await;
        }
        Some(("status", _sub_matches)) => {
            commands::status::run().await;
        }
        _ => {
            println!("seraph v{VERSION}");
            println!("Use --help for available commands");
        }
    }
}
