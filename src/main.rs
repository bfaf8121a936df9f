use clap::Parser;
use faultwrap::{WrapConfig, WrapStatus};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Run a small workload under faultwrap supervision. The workload switches
/// make the supervised child print, panic or exit with a chosen status, so the
/// supervisor's behaviour can be observed from the outside.
#[derive(Parser, Debug)]
#[command(name = "faultwrap", version, about)]
pub struct Cli {
    /// Settings file path
    #[arg(short, long, default_value = "faultwrap.toml")]
    config: PathBuf,

    /// Append captured panic reports to this file as JSON lines (default: stderr)
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Run the workload directly, without a supervising parent
    #[arg(long)]
    no_wrap: bool,

    /// Line to print on stdout (repeatable)
    #[arg(long = "stdout", value_name = "TEXT")]
    stdout_lines: Vec<String>,

    /// Line to print on stderr (repeatable)
    #[arg(long = "stderr", value_name = "TEXT")]
    stderr_lines: Vec<String>,

    /// Print "ready", then block until SIGINT arrives
    #[arg(long)]
    wait_for_interrupt: bool,

    /// Panic with this message after printing
    #[arg(long, value_name = "MESSAGE")]
    panic: Option<String>,

    /// Exit status of the workload
    #[arg(long = "exit", value_name = "CODE", default_value_t = 0)]
    exit_code: i32,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("faultwrap=warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    if !cli.no_wrap {
        let settings = match faultwrap::load_settings(&cli.config) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("faultwrap: {e}");
                std::process::exit(1);
            }
        };

        let report_path = cli.report.clone();
        let config = WrapConfig::from_settings(settings)
            .handler(move |report: Vec<u8>| {
            record_report(report_path.as_deref(), &report)
        });

        match faultwrap::wrap(config).await {
            Ok(WrapStatus::Parent(code)) => std::process::exit(code),
            Ok(WrapStatus::Child) => {}
            Err(e) => {
                eprintln!("faultwrap: {e}");
                std::process::exit(1);
            }
        }
    }

    run_workload(&cli).await;
}

/// Handler for captured panic reports.
fn record_report(path: Option<&Path>, report: &[u8]) {
    let Some(path) = path else {
        eprintln!("=== faultwrap: supervised child panicked ===");
        let _ = std::io::stderr().write_all(report);
        return;
    };

    // JSON needs text; the raw bytes only reach stderr.
    let text = String::from_utf8_lossy(report);
    let entry = serde_json::json!({
        "captured_at": chrono::Utc::now(),
        "supervisor_pid": std::process::id(),
        "report": text,
    });
    let written = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{entry}"));
    if let Err(e) = written {
        eprintln!("faultwrap: failed to write report to {}: {e}", path.display());
        let _ = std::io::stderr().write_all(report);
    }
}

async fn run_workload(cli: &Cli) {
    for line in &cli.stdout_lines {
        println!("{line}");
    }
    for line in &cli.stderr_lines {
        eprintln!("{line}");
    }

    if cli.wait_for_interrupt {
        if let Err(e) = wait_for_interrupt().await {
            eprintln!("failed to listen for SIGINT: {e}");
            std::process::exit(1);
        }
        println!("got interrupt");
    }

    if let Some(message) = &cli.panic {
        panic!("{message}");
    }

    std::process::exit(cli.exit_code);
}

/// Announce readiness only once the listener is registered.
#[cfg(unix)]
async fn wait_for_interrupt() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupts = signal(SignalKind::interrupt())?;
    println!("ready");
    interrupts.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_interrupt() -> std::io::Result<()> {
    println!("ready");
    tokio::signal::ctrl_c().await
}
