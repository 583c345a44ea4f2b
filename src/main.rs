//! oscquery-mirror CLI - mirror and control a remote OSCQuery server.
//!
//! This is the main binary entry point. See the `oscquery_mirror` library
//! for the core functionality.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use oscquery_mirror::{Config, Engine, MirrorEvent, Origin, Value};
use tokio::sync::mpsc::UnboundedReceiver;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// How long one-shot commands wait for the structure.
const SYNC_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "oscquery-mirror")]
#[command(version)]
#[command(about = "Mirror a remote OSCQuery parameter tree")]
struct Cli {
    /// Remote host (implies not local)
    #[arg(long, global = true)]
    host: Option<String>,
    /// Remote OSCQuery port
    #[arg(long, short, global = true)]
    port: Option<u16>,
    /// Custom OSC port
    #[arg(long, global = true)]
    osc_port: Option<u16>,
    /// Read config from this file instead of the config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log every message sent and received
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the remote structure and print it
    Sync,
    /// Mirror the remote and print changes until interrupted
    Watch {
        /// Don't subscribe to every group
        #[arg(long)]
        no_listen: bool,
    },
    /// Set a parameter (or fire a trigger) on the remote
    Send {
        /// Parameter path, e.g. synth/volume
        path: String,
        /// Value components; none fires a trigger
        values: Vec<String>,
    },
    /// Write the effective configuration to the config directory
    SaveConfig,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Sync => run_sync(config),
        Commands::Watch { no_listen } => run_watch(config, !no_listen),
        Commands::Send { path, values } => run_send(config, &path, &values),
        Commands::SaveConfig => {
            let path = config.save()?;
            println!("Saved {}", path.display());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if let Some(host) = &cli.host {
        config.remote_host.clone_from(host);
        config.use_local = false;
    }
    if let Some(port) = cli.port {
        config.remote_port = port;
    }
    if cli.osc_port.is_some() {
        config.osc_port = cli.osc_port;
    }
    if cli.verbose {
        config.log_incoming = true;
        config.log_outgoing = true;
    }
    Ok(config)
}

/// Wait until the engine reports a new structure.
fn wait_for_structure(events: &mut UnboundedReceiver<MirrorEvent>) -> Result<()> {
    let deadline = Instant::now() + SYNC_WAIT;
    while Instant::now() < deadline {
        if SHUTDOWN_FLAG.load(Ordering::SeqCst) {
            anyhow::bail!("Interrupted");
        }
        match events.try_recv() {
            Ok(MirrorEvent::StructureChanged { .. }) => return Ok(()),
            Ok(_) => {}
            Err(_) => std::thread::sleep(Duration::from_millis(20)),
        }
    }
    anyhow::bail!("No structure received within {SYNC_WAIT:?}")
}

fn register_signals() -> Result<()> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

fn run_sync(config: Config) -> Result<()> {
    register_signals()?;
    let (engine, mut events) = Engine::new(config)?;
    engine.sync_now();
    wait_for_structure(&mut events)?;

    if let Some(name) = engine.host_info().and_then(|info| info.name) {
        println!("{name}");
    }
    print!("{}", engine.tree().outline());
    Ok(())
}

fn run_watch(config: Config, listen_all: bool) -> Result<()> {
    register_signals()?;
    let (engine, mut events) = Engine::new(config)?;
    engine.sync_now();
    wait_for_structure(&mut events)?;
    print!("{}", engine.tree().outline());

    if listen_all {
        // Subscriptions are replayed once the push channel connects
        let groups = engine.listen_all();
        log::info!("Listening on {groups} groups");
    }

    while !SHUTDOWN_FLAG.load(Ordering::SeqCst) {
        match events.try_recv() {
            Ok(MirrorEvent::ValueChanged {
                path,
                value,
                origin: Origin::Remote,
            }) => println!("{path} = {value}"),
            Ok(MirrorEvent::Triggered {
                path,
                origin: Origin::Remote,
            }) => println!("{path} !"),
            Ok(MirrorEvent::StructureChanged { .. }) => println!("-- structure changed --"),
            Ok(MirrorEvent::PushChannel { connected }) => {
                log::info!("Push channel {}", if connected { "connected" } else { "disconnected" });
            }
            Ok(_) => {}
            Err(_) => std::thread::sleep(Duration::from_millis(20)),
        }
    }

    println!("Shutting down...");
    Ok(())
}

fn run_send(config: Config, path: &str, values: &[String]) -> Result<()> {
    register_signals()?;
    let (engine, mut events) = Engine::new(config)?;
    engine.sync_now();
    wait_for_structure(&mut events)?;

    let parameter = engine
        .tree()
        .parameter(path)
        .cloned()
        .with_context(|| format!("No parameter at '{path}'"))?;

    let sent = if values.is_empty() {
        engine.trigger(path)
    } else {
        let value = parse_cli_value(values);
        engine.set_value(path, value)
    };

    if sent {
        let (host, port) = engine.outbound_target();
        println!("{path} <{}> -> {host}:{port}", parameter.tag);
    } else {
        println!("{path} unchanged");
    }
    Ok(())
}

/// One argument becomes a scalar, several become an array.
fn parse_cli_value(values: &[String]) -> Value {
    fn scalar(text: &str) -> Value {
        if let Ok(v) = text.parse::<i32>() {
            Value::Int(v)
        } else if let Ok(v) = text.parse::<f32>() {
            Value::Float(v)
        } else if let Ok(b) = text.parse::<bool>() {
            Value::Bool(b)
        } else {
            Value::String(text.to_string())
        }
    }

    match values {
        [single] => scalar(single),
        many => Value::Array(many.iter().map(|v| scalar(v)).collect()),
    }
}
