//! Render Stats
//!
//! Standalone host for the render progress status server.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use daemon::config::Config;
use daemon::lifecycle::{LifecycleEvent, Preconditions, ServerLifecycle};
use daemon::router::STATS_PATH;
use daemon::scheduler::TokioScheduler;
use daemon::stats::{JobMonitor, LogLevel, StatsStore};
use daemon::ui::qr::{generate_png_qr, generate_terminal_qr, generate_terminal_qr_inverted};
use protocol::ProgressSnapshot;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

/// File name of PNG QR codes saved to the data directory.
const DEFAULT_QR_FILE: &str = "status-qr.png";

/// Timeout for `status` queries.
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Render Stats - share live render progress over HTTP.
#[derive(Parser, Debug)]
#[command(name = "render-stats")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the status server and wait for Ctrl-C
    Start {
        /// Port to listen on (0 picks a free port)
        #[arg(long, short)]
        port: Option<u16>,

        /// Skip UPnP port mapping
        #[arg(long)]
        no_upnp: bool,

        /// Do not add a host firewall rule
        #[arg(long)]
        no_firewall: bool,

        /// Simulate a render job with this many frames
        #[arg(long, value_name = "FRAMES")]
        simulate: Option<u64>,

        /// Simulated time per frame in milliseconds
        #[arg(long, default_value = "500")]
        frame_ms: u64,

        /// Also save the URL as a PNG QR code
        #[arg(long, value_name = "FILE")]
        qr_png: Option<PathBuf>,

        /// Print the terminal QR code with inverted colors
        #[arg(long)]
        invert: bool,
    },

    /// Show the progress reported by a running server
    Status {
        /// Published URL, including the key
        #[arg(long, short)]
        url: String,

        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },

    /// Render a URL as a QR code
    Qr {
        /// URL to encode
        #[arg(long, short)]
        url: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "terminal")]
        format: QrFormat,

        /// Output file path for PNG format (defaults to the data directory)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Invert terminal colors
        #[arg(long)]
        invert: bool,
    },
}

/// Output format for QR codes.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrFormat {
    /// Display as text in terminal
    Terminal,
    /// Generate a PNG QR code
    Png,
}

/// Options of the `start` command.
#[derive(Debug, Clone)]
struct StartOptions {
    simulate: Option<u64>,
    frame_time: Duration,
    qr_png: Option<PathBuf>,
    invert: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing
    let level = if cli.verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    // Handle commands
    match cli.command {
        Commands::Start {
            port,
            no_upnp,
            no_firewall,
            simulate,
            frame_ms,
            qr_png,
            invert,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if no_upnp {
                config.nat.upnp_enabled = false;
            }
            if no_firewall {
                config.firewall.enabled = false;
            }
            config.validate()?;

            let options = StartOptions {
                simulate,
                frame_time: Duration::from_millis(frame_ms),
                qr_png,
                invert,
            };
            run_start(config, options).await?;
        }
        Commands::Status { url, json } => {
            let snapshot = query_status(&url).await?;
            if json {
                println!("{}", snapshot.to_json()?);
            } else {
                print!("{}", format_status(&snapshot));
            }
        }
        Commands::Qr {
            url,
            format,
            output,
            invert,
        } => match format {
            QrFormat::Terminal => {
                let qr = if invert {
                    generate_terminal_qr_inverted(&url)
                } else {
                    generate_terminal_qr(&url)
                }
                .context("Failed to generate QR code")?;
                println!("{}", qr);
            }
            QrFormat::Png => {
                let output_path = match output {
                    Some(path) => path,
                    None => {
                        std::fs::create_dir_all(&config.daemon.data_dir).with_context(|| {
                            format!("Failed to create {}", config.daemon.data_dir.display())
                        })?;
                        config.daemon.data_dir.join(DEFAULT_QR_FILE)
                    }
                };
                generate_png_qr(&url, &output_path).context("Failed to generate QR code")?;
                println!("QR code saved to: {}", output_path.display());
            }
        },
    }

    Ok(())
}

/// Runs the server until a shutdown signal arrives.
async fn run_start(config: Config, options: StartOptions) -> anyhow::Result<()> {
    let stats = StatsStore::with_log_capacity(config.stats.log_capacity);
    let scheduler = TokioScheduler::current().context("No tokio runtime")?;
    let mut lifecycle = ServerLifecycle::new(config, stats.clone()).with_scheduler(scheduler);

    // Spawn event logging task
    let mut events = lifecycle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                LifecycleEvent::StateChanged(state) => {
                    tracing::debug!("Server state: {:?}", state);
                }
                LifecycleEvent::UrlPublished { url } => {
                    tracing::debug!("Published {}", url);
                }
                LifecycleEvent::StartFailed { message } => {
                    tracing::error!("Start failed: {}", message);
                }
            }
        }
    });

    // Mapping discovery and the IP lookup block, so start off the runtime.
    let (lifecycle, started) = tokio::task::spawn_blocking(move || {
        let started = lifecycle.start(&Preconditions::satisfied());
        (lifecycle, started)
    })
    .await?;
    started?;

    let lifecycle = announce(lifecycle, &options).await?;

    let shutdown = CancellationToken::new();
    let job = options.simulate.map(|frames| {
        tokio::spawn(simulate_job(
            JobMonitor::new(stats.clone()),
            frames,
            options.frame_time,
            shutdown.clone(),
        ))
    });

    wait_for_shutdown_signal().await;
    tracing::info!("Received shutdown signal");
    shutdown.cancel();
    if let Some(job) = job {
        let _ = job.await;
    }

    stop_server(lifecycle).await
}

/// Prints the published URL, stopping the server if that fails.
async fn announce(
    lifecycle: ServerLifecycle,
    options: &StartOptions,
) -> anyhow::Result<ServerLifecycle> {
    let session = lifecycle.session().clone();
    if !session.mapping_active {
        tracing::warn!("No UPnP mapping; forward the port manually if viewers are remote");
    }
    if let Err(e) = print_url(&session.external_url, options) {
        stop_server(lifecycle).await?;
        return Err(e);
    }
    Ok(lifecycle)
}

/// Tears the server down on the blocking pool.
///
/// Mapping removal and firewall commands block, so the lifecycle must not be
/// stopped or dropped on a runtime worker.
async fn stop_server(mut lifecycle: ServerLifecycle) -> anyhow::Result<()> {
    let report = tokio::task::spawn_blocking(move || lifecycle.stop()).await?;
    for (step, message) in report.failures() {
        eprintln!("Warning: {} failed: {}", step, message);
    }
    Ok(())
}

fn print_url(url: &str, options: &StartOptions) -> anyhow::Result<()> {
    println!("\nRender status available at:\n\n  {}\n", url);

    let qr = if options.invert {
        generate_terminal_qr_inverted(url)
    } else {
        generate_terminal_qr(url)
    };
    match qr {
        Ok(qr) => println!("{}", qr),
        Err(e) => tracing::warn!("Failed to generate QR code: {}", e),
    }

    if let Some(path) = &options.qr_png {
        generate_png_qr(url, path).context("Failed to save QR code")?;
        println!("QR code saved to: {}", path.display());
    }
    Ok(())
}

/// Feeds a fake render job through the host callbacks.
async fn simulate_job(
    monitor: JobMonitor,
    frames: u64,
    frame_time: Duration,
    shutdown: CancellationToken,
) {
    monitor.on_job_start();
    monitor
        .stats()
        .append_log(LogLevel::Info, &format!("Render started: {} frames", frames));

    for frame in 1..=frames {
        tokio::select! {
            _ = shutdown.cancelled() => {
                monitor.stats().append_log(LogLevel::Warning, "Render cancelled.");
                monitor.stats().mark_inactive();
                return;
            }
            _ = tokio::time::sleep(frame_time) => {}
        }
        monitor.on_unit_complete(frame, frames);
    }

    monitor.on_job_end();
}

/// Fetches the snapshot behind a published URL.
async fn query_status(published: &str) -> anyhow::Result<ProgressSnapshot> {
    let url = stats_url(published)?;
    let client = reqwest::Client::builder()
        .timeout(STATUS_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let snapshot = client
        .get(url)
        .send()
        .await
        .context("Failed to reach status server")?
        .error_for_status()
        .context("Status server rejected the request")?
        .json::<ProgressSnapshot>()
        .await
        .context("Invalid status response")?;
    Ok(snapshot)
}

/// Points a published URL at the JSON endpoint, keeping its key.
fn stats_url(published: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(published).with_context(|| format!("Invalid URL: {}", published))?;
    if !url.query_pairs().any(|(name, _)| name == "key") {
        anyhow::bail!("URL has no key parameter: {}", published);
    }
    url.set_path(STATS_PATH);
    Ok(url)
}

fn format_status(snapshot: &ProgressSnapshot) -> String {
    let mut out = format!(
        "Frame:      {}/{} ({:.2}%)\n\
         Last frame: {:.3} s\n\
         Remaining:  {}\n\
         Active:     {}\n",
        snapshot.current_unit,
        snapshot.total_units,
        snapshot.progress_percentage,
        snapshot.last_unit_duration_secs,
        format_duration(snapshot.estimated_remaining_secs),
        if snapshot.active { "yes" } else { "no" },
    );
    if !snapshot.log_tail.is_empty() {
        out.push_str("\nLog:\n");
        out.push_str(&snapshot.log_tail);
        if !snapshot.log_tail.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Wait for a shutdown signal (SIGTERM or Ctrl-C).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Received SIGINT");
                    }
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to register SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to wait for Ctrl-C: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use daemon::network::{
        DisabledPortMapper, Firewall, FirewallError, LookupError, PublicIpResolver,
    };
    use daemon::scheduler::ManualScheduler;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command_defaults() {
        let cli = Cli::try_parse_from(["render-stats", "start"]).unwrap();
        match cli.command {
            Commands::Start {
                port,
                no_upnp,
                no_firewall,
                simulate,
                frame_ms,
                qr_png,
                invert,
            } => {
                assert!(port.is_none());
                assert!(!no_upnp);
                assert!(!no_firewall);
                assert!(simulate.is_none());
                assert_eq!(frame_ms, 500);
                assert!(qr_png.is_none());
                assert!(!invert);
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_start_with_options() {
        let cli = Cli::try_parse_from([
            "render-stats",
            "start",
            "--port",
            "9000",
            "--no-upnp",
            "--simulate",
            "120",
            "--frame-ms",
            "40",
            "--qr-png",
            "/tmp/qr.png",
        ])
        .unwrap();
        match cli.command {
            Commands::Start {
                port,
                no_upnp,
                simulate,
                frame_ms,
                qr_png,
                ..
            } => {
                assert_eq!(port, Some(9000));
                assert!(no_upnp);
                assert_eq!(simulate, Some(120));
                assert_eq!(frame_ms, 40);
                assert_eq!(qr_png, Some(PathBuf::from("/tmp/qr.png")));
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_status_requires_url() {
        assert!(Cli::try_parse_from(["render-stats", "status"]).is_err());
        let cli =
            Cli::try_parse_from(["render-stats", "status", "--url", "http://h:1/?key=k"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { json: false, .. }));
    }

    #[test]
    fn test_qr_command() {
        let cli = Cli::try_parse_from([
            "render-stats",
            "qr",
            "--url",
            "http://h:1/?key=k",
            "--format",
            "png",
            "-o",
            "/tmp/qr.png",
        ])
        .unwrap();
        match cli.command {
            Commands::Qr { format, output, .. } => {
                assert_eq!(format, QrFormat::Png);
                assert_eq!(output, Some(PathBuf::from("/tmp/qr.png")));
            }
            _ => panic!("Expected Qr command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["render-stats", "status", "-u", "http://h/?key=k", "-v", "-c", "x.toml"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
    }

    #[test]
    fn test_stats_url() {
        let url = stats_url("http://[2001:db8::1]:8080/?key=AbC123").unwrap();
        assert_eq!(url.as_str(), "http://[2001:db8::1]:8080/stats?key=AbC123");

        assert!(stats_url("http://host:8080/").is_err());
        assert!(stats_url("not a url").is_err());
    }

    #[test]
    fn test_format_status() {
        let snapshot = ProgressSnapshot::from_counts(50, 200, 0.1, true).with_log("line\n");
        let text = format_status(&snapshot);
        assert!(text.contains("50/200 (25.00%)"));
        assert!(text.contains("Remaining:  15s"));
        assert!(text.contains("Active:     yes"));
        assert!(text.ends_with("Log:\nline\n"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "0s");
        assert_eq!(format_duration(59.4), "59s");
        assert_eq!(format_duration(61.0), "1m 1s");
        assert_eq!(format_duration(3725.0), "1h 2m 5s");
        assert_eq!(format_duration(-3.0), "0s");
    }

    #[tokio::test]
    async fn test_simulate_job_cancelled() {
        let stats = StatsStore::new();
        let token = CancellationToken::new();
        token.cancel();
        simulate_job(
            JobMonitor::new(stats.clone()),
            10,
            Duration::from_secs(10),
            token,
        )
        .await;

        let snapshot = stats.read();
        assert!(!snapshot.active);
        assert!(snapshot.log_tail.contains("Render cancelled."));
    }

    #[tokio::test]
    async fn test_simulate_job_completes() {
        let stats = StatsStore::new();
        simulate_job(
            JobMonitor::new(stats.clone()),
            3,
            Duration::from_millis(1),
            CancellationToken::new(),
        )
        .await;

        let snapshot = stats.read();
        assert_eq!(snapshot.current_unit, 3);
        assert_eq!(snapshot.progress_percentage, 100.0);
        assert!(!snapshot.active);
    }

    struct BlockingFirewall(Arc<AtomicUsize>);

    impl Firewall for BlockingFirewall {
        fn allow(&self, _port: u16) -> Result<(), FirewallError> {
            Ok(())
        }

        fn revoke(&self, _port: u16) -> Result<(), FirewallError> {
            // Panics when called from an async worker thread.
            tokio::runtime::Handle::current().block_on(async {});
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NoPublicIp;

    impl PublicIpResolver for NoPublicIp {
        fn resolve(&self) -> Result<IpAddr, LookupError> {
            Err(LookupError::Request("offline".to_string()))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_announce_stops_server_off_runtime() {
        let revoked = Arc::new(AtomicUsize::new(0));
        let mut config = Config::default();
        config.server.port = 0;
        let mut lifecycle = ServerLifecycle::new(config, StatsStore::new())
            .with_port_mapper(DisabledPortMapper)
            .with_ip_resolver(NoPublicIp)
            .with_firewall(BlockingFirewall(Arc::clone(&revoked)))
            .with_scheduler(ManualScheduler::new());
        lifecycle.start(&Preconditions::satisfied()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let options = StartOptions {
            simulate: None,
            frame_time: Duration::from_millis(1),
            qr_png: Some(dir.path().join("missing").join("qr.png")),
            invert: false,
        };

        let Err(err) = announce(lifecycle, &options).await else {
            panic!("called `Result::unwrap_err()` on an `Ok` value");
        };
        assert!(err.to_string().contains("Failed to save QR code"));
        assert_eq!(revoked.load(Ordering::SeqCst), 1);
    }
}
