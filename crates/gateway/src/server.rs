use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::get,
    },
    serde_json::json,
    tokio::{net::TcpListener, task::JoinHandle},
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{debug, info, warn},
};

use {
    tradeclaw_agents::ProviderRegistry,
    tradeclaw_common::{
        EventPublisher, HookEvent,
        events::{CronFired, GatewayStarted},
        time::now_ms,
    },
    tradeclaw_config::{TradeclawConfig, data_dir, schema::TranscriptBackend},
    tradeclaw_plugins::{
        EventObserver, HookResult, NotificationSink, NotifyRoute, run_event_bus,
    },
    tradeclaw_protocol::{PROTOCOL_VERSION, TICK_INTERVAL_MS, events},
    tradeclaw_sessions::{
        JsonlTranscriptStore, PersistConfig, PersistenceQueue, SessionStore,
        SqliteTranscriptStore, TranscriptStore,
    },
};

use crate::{
    auth,
    methods::{MethodContext, MethodRegistry},
    state::{GatewayServices, GatewayState},
    ws::handle_connection,
};

/// How often the scheduler looks for due cron jobs.
const CRON_POLL: Duration = Duration::from_secs(1);

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    gateway: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
}

// ── Gateway assembly ─────────────────────────────────────────────────────────

/// A fully wired gateway with its background tasks running.
pub struct Gateway {
    pub state: Arc<GatewayState>,
    pub methods: Arc<MethodRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct GatewayBuilder {
    config: TradeclawConfig,
    env_token: Option<String>,
    providers: Option<ProviderRegistry>,
}

impl Gateway {
    pub fn builder(config: TradeclawConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            env_token: None,
            providers: None,
        }
    }

    /// HTTP + WebSocket router for this gateway.
    pub fn app(&self) -> Router {
        build_gateway_app(Arc::clone(&self.state), Arc::clone(&self.methods))
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(
            listener,
            self.app()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;
        self.shutdown().await;
        Ok(())
    }

    /// Stop background loops and wait for queued transcript writes.
    pub async fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.state.services.sessions.flush().await;
        info!("gateway stopped");
    }
}

impl GatewayBuilder {
    /// Extra shared token, usually from `TRADECLAW_TOKEN`.
    pub fn token(mut self, token: Option<String>) -> Self {
        self.env_token = token;
        self
    }

    /// Replace the default (echo) AI providers.
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = Some(providers);
        self
    }

    pub async fn build(self) -> anyhow::Result<Gateway> {
        let Self {
            config,
            env_token,
            providers,
        } = self;
        config.validate()?;

        let (events, rx) = EventPublisher::channel();

        let mut sessions = SessionStore::new(config.sessions.max_messages, events.clone());
        if let Some(store) = open_transcripts(&config).await? {
            // The worker stops once the queue is dropped with the store.
            let (queue, _worker) = PersistenceQueue::spawn(Arc::clone(&store), PersistConfig {
                capacity: config.sessions.persist_queue,
                max_retries: config.sessions.persist_retries,
                retry_delay_ms: config.sessions.persist_retry_delay_ms,
            });
            sessions = sessions.with_persistence(queue, store);
        }

        let mut services = GatewayServices::with_sessions(&config, events.clone(), sessions)?;
        if let Some(providers) = providers {
            services = services.with_providers(providers);
        }

        let resolved_auth = auth::resolve_auth(&config.gateway, env_token);
        if resolved_auth.is_open() {
            warn!("no gateway token configured, connections are not authenticated");
        }
        let route = NotifyRoute::from_config(&config.hooks);
        let state = GatewayState::new(config, resolved_auth, services);
        let methods = Arc::new(MethodRegistry::new());
        let mut tasks = Vec::new();

        let sink: Arc<dyn NotificationSink> = state.services.channels.clone();
        tasks.push(tokio::spawn(run_event_bus(
            rx,
            Arc::clone(&state.services.hooks),
            sink,
            route,
            Some(client_observer(Arc::downgrade(&state))),
        )));
        tasks.push(tokio::spawn(tick_loop(Arc::clone(&state))));
        tasks.push(tokio::spawn(cron_loop(
            Arc::clone(&state),
            Arc::clone(&methods),
        )));

        state.publish(HookEvent::GatewayStarted(GatewayStarted {
            gateway_id: state.gateway_id.clone(),
            version: state.version.clone(),
        }));

        Ok(Gateway {
            state,
            methods,
            tasks,
        })
    }
}

async fn open_transcripts(
    config: &TradeclawConfig,
) -> anyhow::Result<Option<Arc<dyn TranscriptStore>>> {
    let store: Arc<dyn TranscriptStore> = match config.sessions.transcript {
        TranscriptBackend::None => return Ok(None),
        TranscriptBackend::Jsonl => {
            let dir = config
                .sessions
                .transcript_dir
                .clone()
                .unwrap_or_else(|| data_dir().join("sessions"));
            tokio::fs::create_dir_all(&dir).await?;
            info!(dir = %dir.display(), "session transcripts: jsonl");
            Arc::new(JsonlTranscriptStore::new(dir))
        },
        TranscriptBackend::Sqlite => {
            let dir = config.sessions.transcript_dir.clone().unwrap_or_else(data_dir);
            tokio::fs::create_dir_all(&dir).await?;
            let path = dir.join("sessions.db");
            info!(path = %path.display(), "session transcripts: sqlite");
            Arc::new(SqliteTranscriptStore::open(&path).await?)
        },
    };
    Ok(Some(store))
}

/// Pushes domain events that concern every client onto the open streams and
/// bumps the state version on each state change.
fn client_observer(state: Weak<GatewayState>) -> EventObserver {
    Arc::new(move |event: &HookEvent, _results: &[HookResult]| {
        let Some(state) = state.upgrade() else {
            return;
        };
        match event {
            HookEvent::OpportunityDetected(_)
            | HookEvent::DecisionCreated(_)
            | HookEvent::DecisionApproved(_)
            | HookEvent::DecisionRejected(_)
            | HookEvent::DecisionExpired(_)
            | HookEvent::TradeExecuted(_)
            | HookEvent::CronFired(_) => {
                state.streams.bump_state_version();
                let reached = state.streams.broadcast(event.name(), event.payload());
                debug!(event = event.name(), streams = reached, "event pushed to clients");
            },
            HookEvent::SessionCreated(_)
            | HookEvent::SessionCleared(_)
            | HookEvent::SessionDeleted(_) => {
                state.streams.bump_state_version();
            },
            HookEvent::GatewayStarted(_)
            | HookEvent::ClientConnected(_)
            | HookEvent::ClientDisconnected(_)
            | HookEvent::MessageAdded(_)
            | HookEvent::ChatCompleted(_)
            | HookEvent::ChatAborted(_) => {},
        }
    })
}

// ── Background loops ─────────────────────────────────────────────────────────

/// Heartbeat plus housekeeping: expire stale decisions, idempotency entries
/// and idle rate-limit windows, then broadcast a `tick` to every connected
/// stream.
async fn tick_loop(state: Arc<GatewayState>) {
    let mut interval = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
    loop {
        interval.tick().await;
        let now = now_ms();
        let expired = state.services.decisions.expire_stale(now).await;
        let purged = state.idempotency.purge_expired();
        let idle_windows = state.rate_limiter.purge_idle();
        state.record_tick();
        let reached = state.streams.broadcast(
            events::TICK,
            json!({ "ts": now, "stateVersion": state.streams.state_version() }),
        );
        debug!(
            expired = expired.len(),
            purged,
            idle_windows,
            streams = reached,
            "tick"
        );
    }
}

async fn cron_loop(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) {
    let mut interval = tokio::time::interval(CRON_POLL);
    loop {
        interval.tick().await;
        let now = now_ms();
        for job in state.cron.take_due(now) {
            info!(id = %job.id, name = %job.name, method = %job.method, "cron job fired");
            state.publish(HookEvent::CronFired(CronFired {
                job_id: job.id.clone(),
                name: job.name.clone(),
                method: job.method.clone(),
                params: job.params.clone(),
            }));
            let ctx = MethodContext {
                request_id: format!("cron:{}:{now}", job.id),
                method: job.method.clone(),
                params: job.params.clone(),
                conn_id: "cron".into(),
                session_key: format!("cron:{}", job.id),
                principal: "cron".into(),
                state: Arc::clone(&state),
            };
            let methods = Arc::clone(&methods);
            tokio::spawn(async move {
                let response = methods.invoke(ctx).await;
                if let Some(err) = response.error {
                    warn!(id = %job.id, method = %job.method, code = %err.code, msg = %err.message, "cron job failed");
                }
            });
        }
    }
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    let app_state = AppState {
        gateway: state,
        methods,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Start the gateway HTTP + WebSocket server and run until Ctrl-C.
pub async fn start_gateway(config: TradeclawConfig, env_token: Option<String>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let gateway = Gateway::builder(config).token(env_token).build().await?;
    let listener = TcpListener::bind(addr).await?;

    // Startup banner.
    let state = &gateway.state;
    let lines = [
        format!("tradeclaw gateway v{} ({})", state.version, state.gateway_id),
        format!("protocol v{PROTOCOL_VERSION}, listening on {addr}"),
        format!("{} methods registered", gateway.methods.method_names().len()),
        format!("ai: {}", state.services.providers.provider_summary()),
        format!(
            "hooks: {}, channels: {}",
            state.services.hooks.len(),
            state.services.channels.ids().join(", ")
        ),
        format!(
            "auth: {}",
            if state.auth.is_open() { "open" } else { "token" }
        ),
    ];
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    gateway
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.health().await)
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state.gateway, state.methods, addr))
}
