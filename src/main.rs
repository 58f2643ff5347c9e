use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use scan_registry_rs::engine::{self, EngineConfig};
use scan_registry_rs::feeder::{Feeder, RangeFeeder};
use scan_registry_rs::fetchers::FetcherRegistry;
use scan_registry_rs::lifecycle::{self, ScanState, StateSignal};
use scan_registry_rs::ports;
use scan_registry_rs::registry::ScanRegistry;
use scan_registry_rs::server::{self, AppState};

/// scan-registry-rs — live registry of network scan results with an async
/// probe engine and a small JSON read API.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "scan-registry-rs",
    version,
    about = "Live registry of network scan results with an async probe engine.",
    long_about = None
)]
struct Cli {
    /// CIDRs and/or plain IPs, comma separated. If omitted, auto-detect
    /// the local /24 networks.
    #[arg(long)]
    targets: Option<String>,

    /// Inline port spec for the ports fetcher (e.g. "22,80,8000-8010").
    #[arg(long)]
    ports: Option<String>,

    /// Path to a ports file (one port or range per line). Ignored when
    /// --ports is given.
    #[arg(long)]
    ports_file: Option<PathBuf>,

    /// Comma-separated fetcher selection (ip,ping,ports,banner,tls).
    #[arg(long, default_value = "ip,ping,ports")]
    fetchers: String,

    /// Max concurrently probed addresses.
    #[arg(long, default_value_t = 256)]
    concurrency: usize,

    /// Per-connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 400)]
    timeout_ms: u64,

    /// Also keep hosts that answered nothing.
    #[arg(long, default_value_t = false)]
    include_unresponsive: bool,

    /// Serve the JSON read API on this address (e.g. 127.0.0.1:8080)
    /// instead of running one scan.
    #[arg(long)]
    serve: Option<String>,

    /// Write the final results as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let registry = Arc::new(ScanRegistry::new());
    let signal = StateSignal::new();
    let _finalizer = lifecycle::spawn_stop_finalizer(registry.clone(), signal.subscribe());
    let fetcher_registry = Arc::new(FetcherRegistry::with_builtins());

    if let Some(bind) = cli.serve.as_deref() {
        let state = AppState::new(registry, signal, fetcher_registry);
        return server::spawn_server(bind, state).await;
    }

    let feeder = match cli.targets.as_deref() {
        Some(spec) => RangeFeeder::parse(spec)?,
        None => RangeFeeder::detect_local().context("failed to detect local networks")?,
    };

    let sweep_ports = if let Some(spec) = cli.ports.as_deref() {
        ports::parse_port_spec(spec)?
    } else if let Some(path) = cli.ports_file.as_deref() {
        ports::load_ports_file(path)?
    } else {
        ports::default_ports()
    };

    let ids: Vec<&str> = cli
        .fetchers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let selection = fetcher_registry.select(&ids)?;

    let config = EngineConfig {
        concurrency: cli.concurrency,
        timeout: Duration::from_millis(cli.timeout_ms),
        include_unresponsive: cli.include_unresponsive,
        ports: sweep_ports,
    };

    // Ctrl-C aborts the scan; the registry keeps whatever was registered
    // up to that point.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let signal = signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping scan");
                signal.transition(ScanState::Stopping);
                cancel.cancel();
            }
        });
    }

    println!("scanning {} ...", feeder.info());
    let summary = engine::run_scan(
        registry.clone(),
        &feeder,
        selection,
        config,
        cancel,
        signal,
    )
    .await?;

    print_results_table(&registry);
    println!(
        "\n{} scanned, {} alive, {} with open ports in {} ms",
        summary.scanned,
        summary.alive,
        summary.with_ports,
        summary.elapsed().as_millis()
    );

    if let Some(path) = cli.output.as_deref() {
        write_results_json(path, &registry)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
        println!("wrote JSON results to {}", path.display());
    }

    Ok(())
}

fn print_results_table(registry: &ScanRegistry) {
    let specs = registry.selected_fetchers();
    let rows = registry.snapshot();
    if rows.is_empty() {
        println!("no results");
        return;
    }

    // one column per selected fetcher, sized to the widest rendered value
    let mut widths: Vec<usize> = specs.iter().map(|s| s.label.len()).collect();
    let mut rendered: Vec<Vec<String>> = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut cells = Vec::with_capacity(specs.len());
        for slot in 0..specs.len() {
            let mut text = row.value_text(slot).unwrap_or_default();
            if text.len() > 60 {
                text = text.chars().take(60).collect();
            }
            widths[slot] = widths[slot].max(text.len());
            cells.push(text);
        }
        rendered.push(cells);
    }

    println!();
    let header: Vec<String> = specs
        .iter()
        .zip(&widths)
        .map(|(s, w)| format!("{:<width$}", s.label, width = *w))
        .collect();
    println!("{}", header.join("  "));
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    println!("{}", rule.join("  "));
    for cells in rendered {
        let line: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect();
        println!("{}", line.join("  "));
    }
}

fn write_results_json(path: &Path, registry: &ScanRegistry) -> Result<()> {
    let export = serde_json::json!({
        "feeder": registry.feeder_info(),
        "fetchers": registry.selected_fetchers().to_vec(),
        "rows": registry.snapshot().iter().map(|r| r.row()).collect::<Vec<_>>(),
    });
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, &export)?;
    Ok(())
}
