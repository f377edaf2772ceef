//! Minimal HTTP status surface.

use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, routing::get};
use relaykeep_core::supervisor::Roster;
use serde::Serialize;
use std::{net::SocketAddr, time::Instant};
use tokio::net::TcpListener;
use tracing::error;

#[derive(Clone)]
struct StatusState {
    /// Sessions named in the config, whether or not they have started yet.
    configured: usize,
    roster: Roster,
    started: Instant,
}

#[derive(Debug, Serialize)]
struct Overview {
    status: &'static str,
    sessions: usize,
    running: usize,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    uptime: f64,
}

pub fn router(configured: usize, roster: Roster) -> Router {
    Router::new()
        .route("/", get(overview))
        .route("/health", get(health))
        .with_state(StatusState {
            configured,
            roster,
            started: Instant::now(),
        })
}

pub async fn serve(listener: TcpListener, configured: usize, roster: Roster) {
    if let Err(err) = axum::serve(listener, router(configured, roster)).await {
        error!(component = "status", error = %err, "status server stopped");
    }
}

/// The configured bind address, with its port replaced by `port` when set.
pub fn bind_address(bind: &str, port: Option<&str>) -> Result<SocketAddr> {
    let mut addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("status bind address '{bind}'"))?;
    if let Some(port) = port {
        let port = port
            .trim()
            .parse::<u16>()
            .with_context(|| format!("PORT '{port}'"))?;
        addr.set_port(port);
    }
    Ok(addr)
}

async fn overview(State(state): State<StatusState>) -> Json<Overview> {
    Json(Overview {
        status: "online",
        sessions: state.configured,
        running: state.roster.len(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn health(State(state): State<StatusState>) -> Json<Health> {
    Json(Health {
        status: "healthy",
        uptime: state.started.elapsed().as_secs_f64(),
    })
}
