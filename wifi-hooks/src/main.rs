// Network-change hook daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use wifi_hooks::{
    config::{self, HooksConfig},
    dispatcher::{DispatchOptions, Dispatcher},
    executor::{CommandExecutor, DEFAULT_CACHE_TTL, DEFAULT_POOL_SIZE},
    monitor::{EventMonitor, MonitorHandle, MonitorOptions},
    probe::ProbeStack,
    state_file,
    types::ConnectionState,
};

/// Log file used in daemon mode when the config does not name one
const DEFAULT_LOG_PATH: &str = "/var/log/wifi-hooks.log";

/// PID file written in daemon mode
const PID_FILE: &str = "/run/wifi-hooks/daemon.pid";

#[derive(Parser)]
#[command(name = "wifi-hooks")]
#[command(about = "Run configured actions when wireless network state changes", long_about = None)]
struct Cli {
    /// Path to the rule configuration file
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/wifi-hooks/config.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Monitor network changes and execute matching actions
    Monitor {
        /// Run in the background: log to a file and write a PID file
        #[arg(long)]
        daemon: bool,

        /// Polling interval override, e.g. "5s"
        #[arg(long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,

        /// Rely on polling alone instead of the push event stream
        #[arg(long)]
        no_events: bool,

        /// Default action timeout override, e.g. "30s"
        #[arg(long, value_parser = humantime::parse_duration)]
        hook_timeout: Option<Duration>,

        /// Show what would be executed without running commands
        #[arg(long)]
        dry_run: bool,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// Show the current network observation and exit
    Status,
    /// Manage the rule configuration file
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Create an example configuration file
    Init,
    /// Validate the configuration file
    Validate,
    /// Summarize the configured actions
    Show,
}

fn main() -> Result<()> {
    // 2 threads are plenty: one for the dispatch loop, one for the event
    // producers and process spawns
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wifi-hooks")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::Monitor {
            daemon,
            interval,
            no_events,
            hook_timeout,
            dry_run,
            verbose,
        } => {
            run_monitor(
                &cli.config,
                MonitorArgs {
                    daemon,
                    interval,
                    no_events,
                    hook_timeout,
                    dry_run,
                    verbose,
                },
            )
            .await
        }
        CliCommand::Status => run_status().await,
        CliCommand::Config { action } => match action {
            ConfigCommand::Init => config_init(&cli.config),
            ConfigCommand::Validate => config_validate(&cli.config),
            ConfigCommand::Show => config_show(&cli.config),
        },
    }
}

struct MonitorArgs {
    daemon: bool,
    interval: Option<Duration>,
    no_events: bool,
    hook_timeout: Option<Duration>,
    dry_run: bool,
    verbose: bool,
}

async fn run_monitor(config_path: &Path, args: MonitorArgs) -> Result<()> {
    let config = config::load_config(config_path)
        .context("cannot start monitor (create a configuration with 'wifi-hooks config init')")?;

    init_logging(&config, &args)?;

    // CLI flags override the global config block
    let poll_interval = args.interval.unwrap_or(config.global.interval);
    let use_events = config.global.use_events && !args.no_events;
    let default_timeout = args.hook_timeout.unwrap_or(config.global.hook_timeout);

    log::info!(
        "Starting wifi-hooks monitor ({})",
        if use_events { "event-driven" } else { "polling" }
    );
    log::info!("Config: {}", config_path.display());
    log::info!("Actions: {} configured", config.actions.len());
    if !use_events {
        log::info!("Polling interval: {:?}", poll_interval);
    }
    if args.dry_run {
        log::info!("Dry-run mode: commands will be logged, not executed");
    }
    if config.actions.is_empty() {
        log::warn!("No actions configured; changes will be logged only");
    }

    if args.daemon {
        write_pid_file().context("Failed to write PID file")?;
    }

    let executor = CommandExecutor::new(DEFAULT_POOL_SIZE, DEFAULT_CACHE_TTL);
    let probe = ProbeStack::new(executor.clone());
    let monitor = EventMonitor::new(
        probe,
        MonitorOptions {
            poll_interval,
            use_events,
        },
    );
    let (rx, handle) = monitor.start();

    let mut dispatcher = Dispatcher::new(
        config.actions.clone(),
        executor.clone(),
        DispatchOptions {
            max_retries: config.global.max_retries,
            dry_run: args.dry_run,
            write_state: true,
            default_timeout,
        },
    );
    let mut session: JoinHandle<Result<()>> =
        tokio::spawn(async move { dispatcher.run(rx).await });

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    log::info!("Monitor started");

    let result = tokio::select! {
        _ = sigterm.recv() => {
            log::info!("Received SIGTERM");
            stop_session(handle, session).await
        }
        _ = sigint.recv() => {
            log::info!("Received SIGINT");
            stop_session(handle, session).await
        }
        joined = &mut session => {
            // The dispatcher ended on its own (abort-policy failure)
            handle.shutdown().await;
            flatten_session(joined)
        }
    };

    state_file::cleanup();
    if args.daemon {
        remove_pid_file();
    }
    executor.close();

    log::info!("Shutdown complete");
    result
}

/// Stop producers first so the queue closes, then let the dispatcher drain
async fn stop_session(handle: MonitorHandle, session: JoinHandle<Result<()>>) -> Result<()> {
    handle.shutdown().await;
    flatten_session(session.await)
}

fn flatten_session(joined: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("dispatcher task panicked: {}", e)),
    }
}

fn init_logging(config: &HooksConfig, args: &MonitorArgs) -> Result<()> {
    let level = if args.verbose { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if args.daemon {
        let log_path = config
            .global
            .log_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH));
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory for {}", log_path.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn write_pid_file() -> Result<()> {
    let pid_path = Path::new(PID_FILE);
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent).context("Failed to create PID directory")?;
    }
    fs::write(pid_path, format!("{}\n", std::process::id())).context("Failed to write PID file")
}

fn remove_pid_file() {
    let _ = fs::remove_file(PID_FILE);
}

async fn run_status() -> Result<()> {
    let executor = CommandExecutor::new(DEFAULT_POOL_SIZE, DEFAULT_CACHE_TTL);
    let probe = ProbeStack::new(executor.clone());
    let obs = probe.observe().await;

    println!("Network status");
    match obs.state {
        ConnectionState::Connected => {
            println!("  Connected to: {}", obs.ssid.as_deref().unwrap_or("(hidden)"));
            if let Some(interface) = &obs.interface {
                println!("  Interface: {}", interface);
            }
            if let Some(ip) = &obs.ip_address {
                println!("  IP address: {}", ip);
            }
            if let Some(signal) = obs.signal_dbm {
                println!("  Signal: {} dBm", signal);
            }
        }
        other => println!("  State: {}", other),
    }

    executor.close();
    Ok(())
}

fn config_init(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    if path.exists() {
        anyhow::bail!("configuration file already exists at {}", path.display());
    }

    fs::write(path, config::EXAMPLE_CONFIG).context("Failed to write config file")?;

    println!("Configuration created at {}", path.display());
    println!("Edit it to match your networks, then run: wifi-hooks monitor");
    Ok(())
}

fn config_validate(path: &Path) -> Result<()> {
    let config = config::load_config(path)?;
    println!(
        "Configuration is valid: {} ({} actions)",
        path.display(),
        config.actions.len()
    );
    Ok(())
}

fn config_show(path: &Path) -> Result<()> {
    let config = config::load_config(path)?;

    println!("Configuration: {}", path.display());
    println!("Actions configured: {}", config.actions.len());
    println!();

    for (i, action) in config.actions.iter().enumerate() {
        println!("{}. {}", i + 1, action.name);
        if !action.description.is_empty() {
            println!("   Description: {}", action.description);
        }
        if !action.conditions.ssid.is_empty() {
            println!("   SSID conditions: {}", action.conditions.ssid.join(", "));
        }
        if !action.conditions.state.is_empty() {
            println!("   State conditions: {}", action.conditions.state.join(", "));
        }
        if !action.conditions.event_type.is_empty() {
            println!(
                "   Event conditions: {}",
                action.conditions.event_type.join(", ")
            );
        }
        if let Some(min) = action.conditions.signal_min {
            println!("   Minimum signal: {} dBm", min);
        }
        println!(
            "   Commands: {} configured{}",
            action.commands.len(),
            if action.concurrent { " (async)" } else { "" }
        );
        println!();
    }

    Ok(())
}
