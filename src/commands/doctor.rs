use sentinel_core::config::SentinelConfig;

pub async fn run() {
    println!("🔍 Checking agent configuration and environment...\n");

    let mut all_ok = true;

    print!("• Checking seraph.config.json... ");
    let config = match SentinelConfig::load_and_validate(&SentinelConfig::default_path()) {
        Ok(cfg) => {
            println!("✓ valid");
            Some(cfg)
        }
        Err(e) => {
            println!("✗ {e}");
            all_ok = false;
            None
        }
    };

    let port = config.as_ref().map(|c| c.port).unwrap_or(8080);
    print!("• Checking port {port}... ");
    if is_port_in_use(port) {
        println!("✗ already in use");
        all_ok = false;
    } else {
        println!("✓ available");
    }

    print!("• Checking model provider credentials... ");
    if std::env::var("OPENROUTER_API_KEY").is_ok()
        || std::env::var("OPENAI_API_KEY").is_ok()
        || std::env::var("ANTHROPIC_API_KEY").is_ok()
    {
        println!("✓ found");
    } else {
        println!("⚠️  none found, triage/investigation will report permanent model failures");
    }

    print!("• Checking API key (SERAPH_API_KEY / config)... ");
    if config.as_ref().is_some_and(|c| c.api_key.is_some()) {
        println!("✓ configured");
    } else {
        println!("⚠️  not configured, /logs and /chat will accept unauthenticated requests");
    }

    print!("• Checking response cache (redis)... ");
    match config.as_ref().and_then(|c| c.llm_cache.redis.as_ref()) {
        Some(redis) => match check_tcp_reachable(&redis.url) {
            true => println!("✓ reachable"),
            false => {
                println!("○ configured but unreachable, will degrade to no-op");
            }
        },
        None => println!("○ not configured, running without response caching"),
    }

    print!("• Checking report store path writable... ");
    let report_path = sentinel_core::reports::SqliteReportStore::default_path();
    let dir = report_path.parent().unwrap_or_else(|| std::path::Path::new("."));
    if dir.metadata().map(|m| !m.permissions().readonly()).unwrap_or(false) {
        println!("✓ {}", report_path.display());
    } else {
        println!("✗ {} is not writable", dir.display());
        all_ok = false;
    }

    println!();
    if all_ok {
        println!("✅ All checks passed! You're ready to run: seraph up");
    } else {
        println!("⚠️  Some checks failed. Fix the issues above before running seraph up");
        std::process::exit(1);
    }
}

fn is_port_in_use(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_err()
}

fn check_tcp_reachable(url: &str) -> bool {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    let authority = host_port.rsplit('@').next().unwrap_or(host_port);
    let target = if authority.contains(':') { authority.to_string() } else { format!("{authority}:6379") };
    std::net::TcpStream::connect(target).is_ok()
}
