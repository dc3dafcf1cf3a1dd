mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use chrono::{DateTime, Utc};
use perfenv_core::{build_engine, EngineSettings, Evaluator, ExecutionEngine};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::info;
use uuid::Uuid;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One agent's environment
pub struct Session {
    pub evaluator: Arc<Mutex<Evaluator>>,
    pub created_at: DateTime<Utc>,
    /// Unix millis of the last request that touched this session
    last_active: AtomicI64,
}

impl Session {
    pub fn new(evaluator: Evaluator) -> Self {
        let now = Utc::now();
        Self {
            evaluator: Arc::new(Mutex::new(evaluator)),
            created_at: now,
            last_active: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn touch(&self) {
        self.last_active
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn idle_millis(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis() - self.last_active.load(Ordering::Relaxed)
    }
}

/// Bounds on the in-memory session table
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_sessions: usize,
    /// Sessions idle for longer than this are dropped by the sweeper
    pub idle_ttl: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 1024,
            idle_ttl: Duration::from_secs(3600),
        }
    }
}

impl SessionLimits {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut limits = Self::default();
        if let Ok(raw) = std::env::var("PERFENV_MAX_SESSIONS") {
            limits.max_sessions = raw
                .parse()
                .with_context(|| format!("Invalid PERFENV_MAX_SESSIONS: {}", raw))?;
        }
        if let Ok(raw) = std::env::var("PERFENV_SESSION_TTL_SECS") {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("Invalid PERFENV_SESSION_TTL_SECS: {}", raw))?;
            limits.idle_ttl = Duration::from_secs(secs);
        }
        Ok(limits)
    }
}

pub struct AppState {
    pub engine: Arc<dyn ExecutionEngine>,
    pub sessions: RwLock<HashMap<Uuid, Session>>,
    pub limits: SessionLimits,
}

impl AppState {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self::with_limits(engine, SessionLimits::default())
    }

    pub fn with_limits(engine: Arc<dyn ExecutionEngine>, limits: SessionLimits) -> Self {
        Self {
            engine,
            sessions: RwLock::new(HashMap::new()),
            limits,
        }
    }

    /// Drop sessions idle past the TTL; a session mid-step is never dropped
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let ttl = i64::try_from(self.limits.idle_ttl.as_millis()).unwrap_or(i64::MAX);
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| {
            session.idle_millis(now) < ttl || session.evaluator.try_lock().is_err()
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            metrics::ACTIVE_SESSIONS.sub(evicted as i64);
        }
        evicted
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new().merge(routes::routes()).with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("perfenv API booting...");

    let settings = EngineSettings::from_env().context("Invalid engine settings")?;
    let engine = build_engine(&settings)?;
    info!(
        backend = %settings.backend,
        python = %settings.python,
        docker_image = %settings.docker_image,
        "Execution engine ready"
    );

    let limits = SessionLimits::from_env()?;
    info!(
        max_sessions = limits.max_sessions,
        idle_ttl_secs = limits.idle_ttl.as_secs(),
        "Session limits"
    );
    let state = Arc::new(AppState::with_limits(engine, limits));

    let sweeper = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let evicted = sweeper.evict_idle(Utc::now()).await;
            if evicted > 0 {
                info!(evicted = evicted, "Evicted idle sessions");
            }
        }
    });

    let addr = std::env::var("PERFENV_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app(state)).await.context("Server error")?;
    Ok(())
}
