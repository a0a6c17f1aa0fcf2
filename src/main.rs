//! sigil: hotkey registry and coordination bus
//!
//! Without a subcommand, runs the daemon: the coordination engine plus the
//! IPC server host clients talk to. The other subcommands are clients.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use sigil::agent::{self, DEFAULT_HEARTBEAT_MS};
use sigil::config::{self, Config};
use sigil::engine::Engine;
use sigil::host::Page;
use sigil::hotkey::{HotkeySpec, KeyEvent};
use sigil::ipc::{self, HostMessage};
use sigil::namespace::Namespace;
use sigil::registry::{RegistryLoader, candidates};
use sigil::server;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::UnixStream;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "sigil", about = "Hotkey registry and coordination bus")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Registry location to try (repeatable, overrides config)
    #[arg(long = "registry", value_name = "URL", global = true)]
    registry: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Load the registry and print the normalized items
    Check,
    /// Send a key combination to the daemon (e.g. "ctrl+shift+a")
    Key {
        combo: String,
    },
    /// Publish an event on the daemon's bus
    Emit {
        event: String,
        /// JSON payload
        payload: Option<String>,
    },
    /// Print bus events as they are published
    Listen {
        #[arg(default_value = "*")]
        event: String,
    },
    /// Provide the action at a hook path and print each invocation
    Provide {
        hook: String,
    },
    /// Mark a feedback target as detected
    Detect {
        token: String,
        /// Clear the mark instead
        #[arg(long)]
        off: bool,
    },
    /// Join as a registered agent and publish presence until interrupted
    Agent {
        whoami: String,
        #[arg(long, default_value_t = DEFAULT_HEARTBEAT_MS)]
        heartbeat_ms: u64,
    },
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("SIGIL_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn loader(config: &Config) -> RegistryLoader {
    RegistryLoader::new()
        .base_url(config.base_url())
        .schema(config.schema.clone())
}

fn namespace(config: &Config) -> Arc<Namespace> {
    let ns = Arc::new(Namespace::new(Page::loaded()));
    for path in &config.namespaces {
        ns.hooks().ensure_namespace(path);
    }
    ns
}

async fn daemon(registry: &[String]) -> Result<()> {
    let config = config::load_config();
    let ns = namespace(&config);
    ns.bus();

    let server = tokio::spawn(server::start(Arc::clone(&ns)));

    let engine = Engine::new(
        Arc::clone(&ns),
        loader(&config),
        candidates(registry, &config.registry_urls),
    )
    .policy(config.duplicate_policy)
    .flash_duration(config.flash_duration());
    match engine.run().await {
        Ok(state) => info!(?state, "engine settled"),
        Err(e) => warn!("{e}"),
    }

    server.await.context("IPC server task failed")?;
    Ok(())
}

async fn check(registry: &[String]) -> Result<()> {
    let config = config::load_config();
    let loaded = loader(&config)
        .load(&candidates(registry, &config.registry_urls))
        .await?;
    let report = json!({ "url": loaded.url, "items": &*loaded.items });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn send(message: HostMessage) -> Result<()> {
    let path = ipc::socket_path();
    ipc::send(&path, &[message])
        .await
        .with_context(|| format!("cannot reach daemon at {}", path.display()))
}

async fn print_lines(lines: std::io::Result<Lines<BufReader<UnixStream>>>) -> Result<()> {
    let mut lines = lines
        .with_context(|| format!("cannot reach daemon at {}", ipc::socket_path().display()))?;
    while let Some(line) = lines.next_line().await? {
        println!("{line}");
    }
    Ok(())
}

async fn run_agent(registry: &[String], whoami: &str, every: Duration) -> Result<()> {
    let config = config::load_config();
    let me = agent::gate(
        &loader(&config),
        &candidates(registry, &config.registry_urls),
        whoami,
    )
    .await
    .with_context(|| format!("agent {whoami:?} blocked"))?;
    println!("{}", serde_json::to_string_pretty(&me.item)?);

    let path = ipc::socket_path();
    let mut stream = UnixStream::connect(&path)
        .await
        .with_context(|| format!("cannot reach daemon at {}", path.display()))?;
    agent::announce(&mut stream, &me, every)
        .await
        .context("lost connection to daemon")
}

fn init(registry: &[String], force: bool) -> Result<()> {
    let path = config::config_path().context("no config directory on this platform")?;
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = Config {
        registry_urls: registry.to_vec(),
        ..Config::default()
    };
    config::save_config(&config).with_context(|| format!("cannot write {}", path.display()))?;
    println!("{}", path.display());
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        None => daemon(&cli.registry).await,
        Some(Command::Check) => check(&cli.registry).await,
        Some(Command::Key { combo }) => {
            let spec = HotkeySpec::parse(&combo).with_context(|| format!("invalid hotkey {combo:?}"))?;
            send(HostMessage::Key(KeyEvent::from_hotkey(&spec))).await
        }
        Some(Command::Emit { event, payload }) => {
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw).context("payload is not valid JSON")?,
                None => Value::Null,
            };
            send(HostMessage::Emit { event, payload }).await
        }
        Some(Command::Listen { event }) => {
            print_lines(ipc::subscribe(&ipc::socket_path(), &event).await).await
        }
        Some(Command::Provide { hook }) => {
            print_lines(ipc::register(&ipc::socket_path(), &hook).await).await
        }
        Some(Command::Detect { token, off }) => send(HostMessage::Detect { token, on: !off }).await,
        Some(Command::Agent {
            whoami,
            heartbeat_ms,
        }) => run_agent(&cli.registry, &whoami, Duration::from_millis(heartbeat_ms)).await,
        Some(Command::Init { force }) => init(&cli.registry, force),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
    runtime.block_on(run(cli))
}
