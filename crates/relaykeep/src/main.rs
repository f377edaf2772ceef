mod status;

use actor_model::RestartPolicy;
use anyhow::{Context, Result, bail};
use clap::Parser;
use relaykeep_core::{
    config::RelaykeepConfig,
    connection::LineConnector,
    resolve::DnsResolver,
    session::SessionDeps,
    supervisor::{ProcessFault, Supervisor},
};
use std::{path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_SESSION_RESTARTS: usize = 3;

#[derive(Parser)]
#[command(name = "relaykeep", version, about = "Keeps relay sessions connected and executes in-band commands")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(long, default_value = "relaykeep.toml")]
    config: PathBuf,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    debug: bool,
}

enum Outcome {
    Shutdown,
    Fault(ProcessFault),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = RelaykeepConfig::load(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    let port = std::env::var("PORT").ok();
    let bind = status::bind_address(&config.status.bind, port.as_deref())?;

    let deps = SessionDeps {
        engine: Arc::new(config.engine.clone()),
        connector: Arc::new(LineConnector::default()),
        resolver: Arc::new(DnsResolver),
    };
    let mut supervisor = Supervisor::new(
        deps,
        RestartPolicy::MaxRetries {
            n: MAX_SESSION_RESTARTS,
        },
    );

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind status endpoint {bind}"))?;
    info!(component = "status", %bind, "status endpoint listening");
    tokio::spawn(status::serve(
        listener,
        config.sessions.len(),
        supervisor.roster(),
    ));

    info!(sessions = config.sessions.len(), "starting relaykeep");
    let started = tokio::select! {
        res = supervisor.start_all(config.sessions) => Some(res),
        _ = shutdown_signal() => None,
    };
    match started {
        None => {
            supervisor.stop_all().await;
            return Ok(());
        }
        Some(Err(err)) => {
            supervisor.stop_all().await;
            return Err(err).context("start sessions");
        }
        Some(Ok(())) => info!(sessions = supervisor.len(), "all sessions started"),
    }

    let outcome = tokio::select! {
        _ = shutdown_signal() => Outcome::Shutdown,
        fault = supervisor.next_fault() => Outcome::Fault(fault),
    };
    supervisor.stop_all().await;
    match outcome {
        Outcome::Shutdown => {
            info!("shutdown complete");
            Ok(())
        }
        Outcome::Fault(fault) => {
            error!(session = %fault.session, class = ?fault.class, message = %fault.message, "fatal session fault");
            bail!("session {} failed: {}", fault.session, fault.message)
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "debug"
    } else {
        "info,relaykeep=info,relaykeep_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
