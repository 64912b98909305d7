use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use hearth_db::Store;
use hearth_gateway::readiness::default_reader_pool_size;
use hearth_gateway::{ConnContext, Hub, PumpConfig, PumpMode, SessionGate};

use crate::commands::CommandRegistry;
use crate::config::Config;
use crate::http_client::HttpClient;
use crate::plugins::PluginFacade;
use crate::trigger_id::TriggerIdSigner;

/// Largest websocket frame a client may send.
pub const SOCKET_MAX_MESSAGE_SIZE_KB: usize = 8 * 1024;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub gate: Arc<dyn SessionGate>,
    pub hub: Hub,
    pub http: HttpClient,
    pub commands: CommandRegistry,
    pub plugins: PluginFacade,
    pub trigger_ids: TriggerIdSigner,
    pub conn: ConnContext,
}

impl AppStateInner {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        gate: Arc<dyn SessionGate>,
        commands: CommandRegistry,
        plugins: PluginFacade,
        mode: PumpMode,
    ) -> Result<AppState, reqwest::Error> {
        let service = &config.service_settings;
        let http = HttpClient::new(
            service.enable_insecure_outgoing_connections,
            Duration::from_secs(service.outgoing_integration_requests_timeout.max(1)),
        )?;
        let hub = Hub::new();
        let conn = ConnContext {
            hub: hub.clone(),
            store: store.clone(),
            gate: gate.clone(),
            config: PumpConfig {
                pong_wait: Duration::from_secs(service.websocket_pong_wait_seconds.max(1)),
                max_message_size: SOCKET_MAX_MESSAGE_SIZE_KB,
                mode,
                away_timeout: Duration::from_secs(service.user_status_away_timeout),
            },
            reader_permits: Arc::new(Semaphore::new(default_reader_pool_size())),
        };
        Ok(Arc::new(Self {
            config,
            store,
            gate,
            hub,
            http,
            commands,
            plugins,
            trigger_ids: TriggerIdSigner::generate(),
            conn,
        }))
    }
}
