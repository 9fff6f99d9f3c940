use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use {
    serde_json::{Value, json},
    tokio::sync::RwLock,
};

use {
    tradeclaw_agents::{ProviderRegistry, ToolRegistry},
    tradeclaw_channels::{ChannelRegistry, LogChannel},
    tradeclaw_common::{EventPublisher, HookEvent, time::now_ms},
    tradeclaw_config::TradeclawConfig,
    tradeclaw_decisions::{DecisionEngine, PaperExecutor, StaticPriceProvider},
    tradeclaw_plugins::{HookError, HookRegistry, bundled::register_bundled},
    tradeclaw_protocol::{ClientInfo, TICK_INTERVAL_MS},
    tradeclaw_sessions::SessionStore,
};

use crate::{
    auth::ResolvedAuth, chat::ChatRuns, cron::CronScheduler, events::EventStreams,
    idempotency::IdempotencyCache, rate_limit::RateLimiter, tools::default_tools,
};

// ── Connected client ─────────────────────────────────────────────────────────

/// A WebSocket client that completed the `connect` handshake.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub conn_id: String,
    pub session_key: String,
    pub client: ClientInfo,
    pub channel: Option<String>,
    /// Label of the token the client authenticated with.
    pub auth_label: Option<String>,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: Instant,
}

// ── Services ─────────────────────────────────────────────────────────────────

/// Domain components the gateway dispatches into. None of them knows about
/// the others; they talk through the event bus behind `events`.
pub struct GatewayServices {
    pub sessions: Arc<SessionStore>,
    pub decisions: Arc<DecisionEngine>,
    pub hooks: Arc<HookRegistry>,
    pub channels: Arc<ChannelRegistry>,
    pub providers: ProviderRegistry,
    pub tools: Arc<ToolRegistry>,
    pub events: EventPublisher,
}

impl GatewayServices {
    /// Services without transcript persistence: static prices, paper fills,
    /// the echo provider, the log channel and the bundled hooks.
    pub fn in_memory(config: &TradeclawConfig, events: EventPublisher) -> Result<Self, HookError> {
        let sessions = SessionStore::new(config.sessions.max_messages, events.clone());
        Self::with_sessions(config, events, sessions)
    }

    pub fn with_sessions(
        config: &TradeclawConfig,
        events: EventPublisher,
        sessions: SessionStore,
    ) -> Result<Self, HookError> {
        let decisions = Arc::new(DecisionEngine::new(
            config.decisions.clone(),
            Arc::new(StaticPriceProvider::new(config.decisions.prices.clone())),
            Arc::new(PaperExecutor::new()),
            events.clone(),
        ));

        let hooks = HookRegistry::from_config(config);
        register_bundled(&hooks)?;

        let mut channels = ChannelRegistry::new();
        channels.register(Arc::new(LogChannel::new("log")));

        Ok(Self {
            sessions: Arc::new(sessions),
            tools: Arc::new(default_tools(&decisions)),
            decisions,
            hooks: Arc::new(hooks),
            channels: Arc::new(channels),
            providers: ProviderRegistry::with_echo(),
            events,
        })
    }

    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, built once per process and passed around
/// as `Arc<GatewayState>`.
pub struct GatewayState {
    pub config: TradeclawConfig,
    pub gateway_id: String,
    pub version: String,
    pub hostname: String,
    pub started_at: Instant,
    pub auth: ResolvedAuth,
    /// All connected WebSocket clients, keyed by conn_id.
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    pub streams: EventStreams,
    pub idempotency: IdempotencyCache,
    pub rate_limiter: RateLimiter,
    pub chat_runs: ChatRuns,
    pub cron: CronScheduler,
    /// Epoch ms of the last maintenance tick, `0` before the first one.
    pub last_tick_at: AtomicU64,
    pub services: GatewayServices,
}

impl GatewayState {
    pub fn new(config: TradeclawConfig, auth: ResolvedAuth, services: GatewayServices) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());
        let gateway_id = config
            .gateway
            .gateway_id
            .clone()
            .unwrap_or_else(|| hostname.clone());

        Arc::new(Self {
            streams: EventStreams::new(config.gateway.event_buffer),
            idempotency: IdempotencyCache::new(&config.idempotency),
            rate_limiter: RateLimiter::new(&config.rate_limits),
            chat_runs: ChatRuns::default(),
            cron: CronScheduler::new(),
            clients: RwLock::new(HashMap::new()),
            last_tick_at: AtomicU64::new(0),
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            gateway_id,
            hostname,
            auth,
            services,
            config,
        })
    }

    pub fn publish(&self, event: HookEvent) {
        self.services.events.publish(event);
    }

    /// Register a new client connection.
    pub async fn register_client(&self, client: ConnectedClient) {
        let conn_id = client.conn_id.clone();
        self.clients.write().await.insert(conn_id, client);
    }

    /// Remove a client by conn_id. Returns the removed client if found.
    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.clients.write().await.remove(conn_id)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn record_tick(&self) {
        self.last_tick_at.store(now_ms(), Ordering::Relaxed);
    }

    /// Body of `GET /health` and the `health` method.
    pub async fn health(&self) -> Value {
        let last_tick = self.last_tick_at.load(Ordering::Relaxed);
        json!({
            "status": "ok",
            "version": self.version,
            "gatewayId": self.gateway_id,
            "uptime": self.uptime_secs(),
            "clients": self.client_count().await,
            "sessions": self.services.sessions.len(),
            "agent": {
                "providers": self.services.providers.ids(),
                "tools": self.services.tools.names(),
                "activeRuns": self.chat_runs.len(),
            },
            "heartbeat": {
                "intervalMs": TICK_INTERVAL_MS,
                "lastTickAt": (last_tick > 0).then_some(last_tick),
            },
            "cron": {
                "jobs": self.cron.len(),
                "enabled": self.cron.enabled_count(),
                "nextRunAt": self.cron.next_run_at(),
            },
        })
    }
}
