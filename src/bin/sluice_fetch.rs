//! Sluice Fetch - parallel TCP fetch di atas connection engine
//!
//! Membuka N connection ke satu host, mengirim request (opsional), membaca
//! sampai peer menutup koneksi, lalu mencetak statistik engine.
//!
//! Usage:
//!   cargo run --release --bin sluice_fetch -- [OPTIONS] <HOST>

use std::collections::HashMap;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sluice::network::{ConnectOptions, MioRuntime};
use sluice::{Engine, EngineConfig, EngineError, MessageKind};

/// Deadline connect kalau config maupun `--timeout` tidak mengisinya
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Konfigurasi CLI
struct FetchConfig {
    host: Option<String>,
    port: u16,
    count: usize,
    request: Option<String>,
    config_path: Option<String>,
    connect_timeout_ms: Option<u64>,
    max_per_host: Option<u32>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 80,
            count: 1,
            request: None,
            config_path: None,
            connect_timeout_ms: None,
            max_per_host: None,
        }
    }
}

/// Hasil per connection
#[derive(Default)]
struct FetchResult {
    bytes: u64,
    done: bool,
    failed: Option<u64>,
}

fn parse_args() -> FetchConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = FetchConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    config.port = args[i + 1].parse().unwrap_or(80);
                    i += 1;
                }
            }
            "--count" | "-n" => {
                if i + 1 < args.len() {
                    config.count = args[i + 1].parse().unwrap_or(1);
                    i += 1;
                }
            }
            "--request" | "-r" => {
                if i + 1 < args.len() {
                    config.request = Some(args[i + 1].replace("\\r\\n", "\r\n"));
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config.config_path = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--timeout" => {
                if i + 1 < args.len() {
                    config.connect_timeout_ms = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--per-host" => {
                if i + 1 < args.len() {
                    config.max_per_host = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Sluice Fetch - parallel TCP fetch\n");
                println!("Usage: sluice_fetch [OPTIONS] <HOST>\n");
                println!("Options:");
                println!("  -p, --port <PORT>      Port (default: 80)");
                println!("  -n, --count <N>        Parallel connections (default: 1)");
                println!("  -r, --request <TEXT>   Data dikirim setelah connect (\\r\\n di-escape)");
                println!("  -c, --config <PATH>    Engine config TOML");
                println!("      --timeout <MS>     Connect timeout override");
                println!("      --per-host <N>     Per-host connection limit override");
                println!("  -h, --help             Show this help");
                println!("\nLog level via RUST_LOG (default: sluice=info)");
                std::process::exit(0);
            }
            other => config.host = Some(other.to_string()),
        }
        i += 1;
    }

    config
}

fn build_engine_config(cli: &FetchConfig) -> Result<EngineConfig, EngineError> {
    let mut config = match &cli.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.connect_timeout_ms = cli
        .connect_timeout_ms
        .or(config.connect_timeout_ms)
        .or(Some(DEFAULT_CONNECT_TIMEOUT_MS));
    if let Some(per_host) = cli.max_per_host {
        config.max_connections_per_host = per_host;
        config.max_connections = config.max_connections.max(per_host);
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: FetchConfig) -> Result<(), Box<dyn std::error::Error>> {
    let host = cli.host.clone().ok_or("missing <HOST>")?;
    let config = build_engine_config(&cli)?;

    let mut runtime = MioRuntime::new()?;
    let mut engine = Engine::new(
        config,
        runtime.event_loop(),
        runtime.resolver(),
        runtime.socket_factory(),
    )?;

    let start = Instant::now();
    let mut results: HashMap<u64, FetchResult> = HashMap::new();
    for _ in 0..cli.count {
        let id = engine.create_connection(&host, ConnectOptions::new(cli.port), None);
        if let Some(request) = &cli.request {
            engine.send_data(id, request.as_bytes().to_vec())?;
        }
        match engine.init_load(id) {
            Ok(progress) => debug!(conn = id, ?progress, "load started"),
            Err(err) => {
                warn!(conn = id, %err, "load rejected");
                engine.safe_destruction(id);
                results.insert(
                    id,
                    FetchResult {
                        done: true,
                        failed: Some(u64::from(err.code())),
                        ..FetchResult::default()
                    },
                );
                continue;
            }
        }
        results.insert(id, FetchResult::default());
    }

    let mut buf = vec![0u8; 64 * 1024];
    while results.values().any(|r| !r.done) {
        for msg in runtime.turn(&mut engine, Duration::from_millis(50))? {
            let Some(result) = results.get_mut(&msg.id) else {
                continue;
            };
            match msg.kind {
                MessageKind::ConnectionEstablished => info!(conn = msg.id, "connected"),
                MessageKind::DataReady => loop {
                    let n = engine.read_data(msg.id, &mut buf)?;
                    if n == 0 {
                        break;
                    }
                    result.bytes += n as u64;
                },
                MessageKind::LoadingFinished => {
                    result.done = true;
                    engine.safe_destruction(msg.id);
                }
                MessageKind::LoadingFailed => {
                    result.done = true;
                    result.failed = Some(msg.param);
                    engine.safe_destruction(msg.id);
                }
                _ => {}
            }
        }
    }

    let elapsed = start.elapsed();
    let failed = results.values().filter(|r| r.failed.is_some()).count();
    let bytes: u64 = results.values().map(|r| r.bytes).sum();
    let stats = engine.stats();
    info!(
        connections = results.len(),
        failed,
        bytes,
        elapsed_ms = elapsed.as_millis() as u64,
        destroyed = stats.destroyed_total,
        sweep_ticks = stats.sweep_ticks,
        "fetch complete"
    );
    engine.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sluice=info")),
        )
        .init();

    let cli = parse_args();
    if let Err(err) = run(cli) {
        error!(%err, "fetch failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
