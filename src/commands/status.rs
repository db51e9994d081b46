use sentinel_core::config::SentinelConfig;
use serde::Deserialize;

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    version: String,
    uptime_secs: u64,
    memory_rss_kb: u64,
    queue_depth: u64,
    running_investigations: u64,
    triage_workers_alive: u64,
    investigation_workers_alive: u64,
}

pub async fn run() {
    let config = SentinelConfig::load_and_validate(&SentinelConfig::default_path()).unwrap_or_default();

    println!("📊 Seraph Agent Status\n");

    let url = format!("http://127.0.0.1:{}/status", config.port);
    let client = reqwest::Client::new();
    let mut request = client.get(&url);
    if let Some(key) = &config.api_key {
        request = request.bearer_auth(key);
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => match response.json::<StatusResponse>().await {
            Ok(status) => {
                println!("Agent        ✓ {} (v{})", status.status, status.version);
                println!("Uptime       {}s", status.uptime_secs);
                println!("Memory       {} KB", status.memory_rss_kb);
                println!("Queue depth  {}", status.queue_depth);
                println!("Running      {} investigation(s)", status.running_investigations);
                println!("Triage       {} worker(s) alive", status.triage_workers_alive);
                println!("Investigate  {} worker(s) alive", status.investigation_workers_alive);
            }
            Err(e) => eprintln!("✗ Unexpected response from agent: {e}"),
        },
        Ok(response) => {
            eprintln!("✗ Agent returned {}", response.status());
        }
        Err(_) => {
            println!("✗ Not running (start with: seraph up)");
        }
    }
}
