//! Stride - demo RPC server over line-delimited TCP.

use std::env;
use std::process::ExitCode;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stride::config::Settings;
use stride::{CallContext, Handler, Methods, Params, Payload, RpcError, RpcResult, Server};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const NAME: &str = env!("CARGO_PKG_NAME");

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return ExitCode::SUCCESS;
    }

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{} {}", NAME, VERSION);
        return ExitCode::SUCCESS;
    }

    // Without --config the built-in defaults apply
    let settings = match get_config_path(&args) {
        Some(path) => match Settings::load(&path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error loading configuration: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };

    if settings.logging.enabled {
        init_logging(&settings);
    }

    info!("Starting {} v{}", NAME, VERSION);
    info!("Log level: {}", settings.logging.level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(async_main(settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

async fn async_main(settings: Settings) -> RpcResult<()> {
    let mut server = Server::builder(&settings)
        .on_connect(|conn| info!(conn_id = %conn.id(), peer = %conn.peer_addr(), "Peer joined"))
        .on_disconnect(|conn| info!(conn_id = %conn.id(), "Peer left"))
        .start(DemoHandler::default)
        .await?;

    match server.local_addr() {
        Some(addr) => info!(address = %addr, "Listening"),
        None => info!("Listener disabled by configuration"),
    }

    shutdown_signal().await?;
    info!("Shutdown signal received, stopping server...");
    server.stop().await;

    info!(
        requests = server.metrics().total_requests(),
        failed = server.metrics().failed_requests(),
        "Final request counts"
    );
    Ok(())
}

/// Methods exposed by the demo server.
#[derive(Debug, Default)]
struct DemoHandler {
    pings: u64,
}

impl DemoHandler {
    fn ping(&mut self, _ctx: &mut CallContext, _params: Params) -> RpcResult<Payload> {
        self.pings += 1;
        Ok(self.pings.into())
    }

    fn echo(&mut self, _ctx: &mut CallContext, params: Params) -> RpcResult<Payload> {
        params.expect_len(1)?;
        Ok(params.payload(0)?.clone())
    }

    fn add(&mut self, _ctx: &mut CallContext, params: Params) -> RpcResult<Payload> {
        sum(&params)
    }

    fn divide(&mut self, _ctx: &mut CallContext, params: Params) -> RpcResult<Payload> {
        params.expect_len(2)?;
        let divisor = params.get_f64(1)?;
        if divisor == 0.0 {
            return Err(RpcError::failed("divided by 0"));
        }
        Ok((params.get_f64(0)? / divisor).into())
    }

    /// Relay a message to every connected peer.
    fn say(&mut self, ctx: &mut CallContext, params: Params) -> RpcResult<Payload> {
        let text = params.get_string(0)?;
        let from = ctx.caller().peer_addr().to_string();
        ctx.broadcast("said", vec![from.into(), text.into()]);
        Ok(Payload::Null)
    }

    fn who(&mut self, ctx: &mut CallContext, _params: Params) -> RpcResult<Payload> {
        let peers: Vec<Payload> = ctx
            .server()
            .connections()
            .iter()
            .map(|c| c.peer_addr().to_string().into())
            .collect();
        Ok(peers.into())
    }
}

/// Add two numbers, staying integral when both are integers that fit.
fn sum(params: &Params) -> RpcResult<Payload> {
    params.expect_len(2)?;
    let integral = params
        .payload(0)?
        .as_i64()
        .zip(params.payload(1)?.as_i64())
        .and_then(|(a, b)| a.checked_add(b));

    match integral {
        Some(total) => Ok(total.into()),
        None => Ok((params.get_f64(0)? + params.get_f64(1)?).into()),
    }
}

impl Handler for DemoHandler {
    fn register(methods: &mut Methods<Self>) {
        methods
            .register("ping", Self::ping)
            .register("echo", Self::echo)
            .register("add", Self::add)
            .register("divide", Self::divide)
            .register("say", Self::say)
            .register("who", Self::who);
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() -> RpcResult<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result?,
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c().await?;

    Ok(())
}

fn print_help() {
    println!(
        r#"{} {}
Demo JSON-RPC server over line-delimited TCP.

USAGE:
    {} [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file
                           [default: built-in settings, 127.0.0.1:30274]
    -h, --help             Print help information
    -V, --version          Print version information

METHODS:
    ping, echo, add, divide, say, who
"#,
        NAME, VERSION, NAME
    );
}

/// Get configuration file path from command line arguments.
fn get_config_path(args: &[String]) -> Option<String> {
    for (i, arg) in args.iter().enumerate() {
        if (arg == "--config" || arg == "-c") && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Initialize logging based on settings.
fn init_logging(settings: &Settings) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));

    match settings.logging.format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }
}
