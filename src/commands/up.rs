use std::path::PathBuf;

use clap::ArgMatches;
use sentinel_core::config::{load_env_overrides, SentinelConfig};

pub async fn run(matches: &ArgMatches) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(SentinelConfig::default_path);

    let mut config = match SentinelConfig::load_and_validate(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("✗ Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    load_env_overrides(&mut config);

    if config.api_key.is_none() {
        eprintln!("⚠️  No API key configured, /logs and /chat will accept unauthenticated requests");
    }

    println!("✓ Starting seraph agent on :{}", config.port);
    println!(
        "✓ {} triage worker(s), {} investigation worker(s)",
        config.triage_worker_count(),
        config.investigation_worker_count()
    );

    let agent = match sentinel_core::agent_manager::start(config).await {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("✗ Failed to start: {e}");
            std::process::exit(1);
        }
    };

    println!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.ok();
    println!("\n✓ Shutting down...");
    agent.shutdown().await;
    println!("✓ Stopped");
}
