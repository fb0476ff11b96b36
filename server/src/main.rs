use clap::Parser;
use log::{error, info, warn};
use server::admin::CommandExecutor;
use server::config::ServerConfig;
use server::console::{run_console, ConsoleExit};
use server::database::MemoryDatabase;
use server::server::Server;
use server::world::World;
use shared::{ServerIdentity, TransportKind};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

/// Command line arguments. Anything given here overrides the config file.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// TOML configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Address to bind to
    #[clap(short = 'H', long)]
    host: Option<String>,
    /// Stream (TCP) port
    #[clap(short, long)]
    port: Option<u16>,
    /// WebSocket port (defaults to port + 1)
    #[clap(long)]
    websocket_port: Option<u16>,
    /// Maximum concurrent sessions
    #[clap(long)]
    max_clients: Option<usize>,
    /// Ticks per second
    #[clap(short, long)]
    tick_rate: Option<u32>,
    /// Server identity key file
    #[clap(long)]
    key_file: Option<PathBuf>,
    /// Do not start the stream transport
    #[clap(long)]
    no_stream: bool,
    /// Do not start the WebSocket transport
    #[clap(long)]
    no_websocket: bool,
    /// Do not read commands from standard input
    #[clap(long)]
    noconsole: bool,
    /// Exit immediately on a fatal fault instead of waiting for Enter
    #[clap(long)]
    nohalt: bool,
    /// Write a fresh identity to the key file and exit
    #[clap(long)]
    generate_key: bool,
    /// Accounts to create at startup in the in-memory database
    #[clap(long = "account", value_name = "NAME")]
    accounts: Vec<String>,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.websocket_port.is_some() {
            config.websocket_port = self.websocket_port;
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        if let Some(tick_rate) = self.tick_rate {
            config.tick_rate = tick_rate;
        }
        if let Some(key_file) = &self.key_file {
            config.key_file = key_file.clone();
        }
        if self.no_stream {
            config.enable_stream = false;
        }
        if self.no_websocket {
            config.enable_websocket = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let halt = !args.nohalt;
    install_panic_hook();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    args.apply(&mut config);

    if args.generate_key {
        let identity = ServerIdentity::generate();
        identity.save(&config.key_file)?;
        info!(
            "Wrote server identity {} to {}",
            identity.fingerprint(),
            config.key_file.display()
        );
        return Ok(());
    }

    let identity = match ServerIdentity::load(&config.key_file) {
        Ok(identity) => identity,
        Err(e) => {
            error!("Cannot load server identity: {}", e);
            error!("Run with --generate-key to create one");
            return Err(e.into());
        }
    };

    let database = Arc::new(MemoryDatabase::with_accounts(&args.accounts));
    let started = Server::start(&config, identity, database, Box::new(World::new())).await;
    let mut running = match started {
        Ok(running) => running,
        Err(e) => {
            error!("Server failed to start: {}", e);
            return Err(e.into());
        }
    };
    for kind in [TransportKind::Stream, TransportKind::WebSocket] {
        if let Some(addr) = running.local_addr(kind) {
            info!("Accepting {} connections on {}", kind, addr);
        }
    }

    // The console and the fault prompt must share one stdin reader.
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let executor = CommandExecutor::new(Arc::clone(running.context()));
    let console = async {
        if args.noconsole {
            std::future::pending::<ConsoleExit>().await
        } else {
            run_console(&executor, &mut input, std::io::stdout()).await
        }
    };

    let fault = tokio::select! {
        exit = console => {
            match exit {
                ConsoleExit::Command => info!("Exit requested from console"),
                ConsoleExit::EndOfInput => info!("Console input closed"),
            }
            None
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            None
        }
        fault = running.fault() => Some(fault),
    };
    if let Some(fault) = fault {
        error!("Tick loop failed: {}", fault);
        wait_for_operator(halt, &mut input).await;
        std::process::exit(1);
    }

    let saved = running.shutdown().await;
    info!("Shutdown complete, {} characters saved", saved);

    // A pending stdin read sits on a blocking thread that cannot be
    // cancelled, so leave without waiting for the runtime to drain.
    std::process::exit(0);
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut interrupt, mut terminate) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
            _ => {
                warn!("Cannot install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!("Unhandled fault: {}\n{}", info, backtrace);
    }));
}

async fn wait_for_operator<R: AsyncBufRead + Unpin>(halt: bool, input: &mut Lines<R>) {
    if halt {
        eprintln!("The server hit a fatal fault. Press Enter to exit.");
        let _ = input.next_line().await;
    }
}
