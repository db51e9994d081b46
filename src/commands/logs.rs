use clap::ArgMatches;
use sentinel_core::types::LogRecord;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const SOCKET_NAME: &str = ".seraph.sock";

pub async fn run(matches: &ArgMatches) {
    let follow = matches.get_flag("follow");
    let lines: usize = matches.get_one::<String>("lines").unwrap().parse().unwrap_or(50);

    let socket_path = std::env::current_dir().unwrap_or_else(|_| ".".into()).join(SOCKET_NAME);
    if !socket_path.exists() {
        eprintln!("⚠️  No local socket found. Start the agent with: seraph up");
        return;
    }

    if follow {
        println!("📝 Polling recent logs (Ctrl+C to stop)...\n");
        loop {
            if let Some(records) = fetch_logs(&socket_path).await {
                print_records(&records, lines);
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
        }
    } else {
        match fetch_logs(&socket_path).await {
            Some(records) => print_records(&records, lines),
            None => eprintln!("✗ Failed to reach the agent's local socket"),
        }
    }
}

async fn fetch_logs(socket_path: &std::path::Path) -> Option<Vec<LogRecord>> {
    let mut stream = UnixStream::connect(socket_path).await.ok()?;
    stream.write_all(b"get_logs").await.ok()?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.ok()?;
    serde_json::from_slice(&buf).ok()
}

fn print_records(records: &[LogRecord], limit: usize) {
    for record in records.iter().take(limit) {
        println!("{}", colorize_log_line(&record.text));
    }
}

fn colorize_log_line(line: &str) -> String {
    if line.contains("ERROR") || line.contains("panic") {
        format!("\x1b[31m{line}\x1b[0m")
    } else if line.contains("WARN") {
        format!("\x1b[33m{line}\x1b[0m")
    } else {
        line.to_string()
    }
}
