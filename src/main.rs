//! The gateway binary.
//!
//! Usage: `function-gateway [CONFIG]`. The configuration file may also be
//! named by `GATEWAY_CONFIG`; with neither, built-in defaults apply. Log
//! filters are read from `GATEWAY_LOG` (default `info`).

use futures::future::select;
use log::Level;
use std::error::Error;
use std::io::Write;
use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal::unix::{SignalKind, signal};

use function_gateway::{Gateway, GatewayConfig, RuntimeContext, server, tls};

const ENV_LOG: &str = "GATEWAY_LOG";
const ENV_CONFIG: &str = "GATEWAY_CONFIG";

fn init_logging() {
    let start_time = Instant::now();
    let mut builder = env_logger::Builder::new();
    builder.format(move |fmt, record| {
        let level = match record.level() {
            Level::Trace => "TRCE",
            Level::Debug => "DBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERR!",
        };
        let uptime = start_time.elapsed();
        writeln!(
            fmt,
            "{} [{:>6}.{:06}s] {} {}",
            level,
            uptime.as_secs(),
            uptime.subsec_micros(),
            record.target(),
            record.args()
        )
    });
    builder.parse_filters(&std::env::var(ENV_LOG).unwrap_or_else(|_| "info".to_owned()));
    builder.init();
}

async fn shutdown_signal() -> Result<(), std::io::Error> {
    let mut terminate = signal(SignalKind::terminate())?;
    let interrupt = pin!(tokio::signal::ctrl_c());
    let terminated = pin!(terminate.recv());
    select(interrupt, terminated).await;
    log::info!("shutdown requested");
    Ok(())
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = match std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(ENV_CONFIG))
    {
        Some(path) => GatewayConfig::load(path)?,
        None => {
            log::info!("no configuration file given, using defaults");
            GatewayConfig::default()
        }
    };
    let ctx = RuntimeContext::from_env()?;

    let acceptor = match config.server.tls {
        Some(ref c) => Some(tokio_rustls::TlsAcceptor::from(Arc::new(
            tls::server_config(c)?,
        ))),
        None => None,
    };
    let listener = tokio::net::TcpListener::bind(&config.server.address).await?;
    let gateway = Gateway::new(config, ctx)?;

    let shutdown = shutdown_signal();
    let shutdown = async {
        if let Err(e) = shutdown.await {
            log::error!("cannot listen for termination signals: {}", e);
            std::future::pending::<()>().await;
        }
    };
    server::serve(listener, acceptor, gateway.dispatcher(), shutdown).await;
    gateway.close();
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run().await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
