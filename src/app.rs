//! 组件装配：由 AppConfig 构建存储、外部客户端、Worker 工厂、编排器与 Webhook 流水线

use std::sync::Arc;
use std::time::Duration;

use crate::api::ApiState;
use crate::config::{ApiSection, AppConfig, CrmSection};
use crate::core::{
    HiveError, OrchestratorSettings, ShutdownManager, TerminationDetector, TurnOrchestrator,
};
use crate::http::{RefreshingToken, ResilientClient, StaticToken, TokenProvider};
use crate::integrations::{ConversationPlatform, CrmClient, PricingClient, ShipmentClient};
use crate::llm::create_llm_from_config;
use crate::notify::NotificationHub;
use crate::store::create_session_store;
use crate::webhook::{DedupGuard, WebhookPipeline};
use crate::workers::{CreateTicket, DefaultWorkerFactory, PricingLookup, ShipmentLookup};

/// 运行期共享组件
pub struct AppComponents {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub notifier: Arc<NotificationHub>,
    /// `[webhook] enabled = false` 时为 None
    pub pipeline: Option<Arc<WebhookPipeline>>,
    pub shutdown: Arc<ShutdownManager>,
}

impl AppComponents {
    pub fn api_state(&self) -> Arc<ApiState> {
        Arc::new(ApiState {
            orchestrator: Arc::clone(&self.orchestrator),
            pipeline: self.pipeline.clone(),
            shutdown: Arc::clone(&self.shutdown),
        })
    }
}

fn crm_platform(cfg: &CrmSection) -> Result<Arc<dyn ConversationPlatform>, HiveError> {
    let tokens: Arc<dyn TokenProvider> = match &cfg.oauth {
        Some(oauth) => Arc::new(RefreshingToken::new(
            oauth.token_url.clone(),
            oauth.client_id.clone(),
            oauth.client_secret.clone(),
            oauth.refresh_token.clone(),
            cfg.access_token.clone(),
            Duration::from_secs(cfg.timeout_secs),
        )
        .map_err(|e| HiveError::Config(format!("crm token client: {e}")))?),
        None => {
            let token = cfg
                .access_token
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| HiveError::Config("crm.access_token must be set".to_string()))?;
            Arc::new(StaticToken::new(token))
        }
    };
    let http = ResilientClient::new("crm", cfg.base_url.clone(), tokens, Duration::from_secs(cfg.timeout_secs))
        .map_err(|e| HiveError::Config(format!("crm client: {e}")))?;
    Ok(Arc::new(CrmClient::new(
        http,
        cfg.sender_actor_id.clone(),
        cfg.ticket_pipeline.clone(),
        cfg.ticket_stage.clone(),
    )))
}

fn api_client(name: &str, section: &ApiSection) -> Result<ResilientClient, HiveError> {
    let (base_url, api_key) = section.endpoint(name)?;
    ResilientClient::new(
        name,
        base_url,
        Arc::new(StaticToken::new(api_key)),
        Duration::from_secs(section.timeout_secs),
    )
    .map_err(|e| HiveError::Config(format!("{name} client: {e}")))
}

/// 按配置装配全部组件；任何配置错误在此处即返回
pub async fn create_components(
    cfg: &AppConfig,
    shutdown: Arc<ShutdownManager>,
) -> Result<AppComponents, HiveError> {
    let roster = cfg.validate()?;
    let llm = create_llm_from_config(&cfg.llm)?;
    let store = create_session_store(&cfg.store).await;

    let platform = if cfg.crm.has_credentials() {
        Some(crm_platform(&cfg.crm)?)
    } else {
        None
    };

    let mut factory = DefaultWorkerFactory::new(llm, cfg.orchestrator.markers.clone());
    for spec in roster.specialists() {
        match spec.capability.as_deref() {
            Some("pricing") => {
                let client = PricingClient::new(api_client("pricing", &cfg.pricing)?);
                factory = factory.with_capability("pricing", Arc::new(PricingLookup::new(Arc::new(client))));
            }
            Some("shipment") => {
                let client = ShipmentClient::new(api_client("shipment", &cfg.shipment)?);
                factory = factory.with_capability("shipment", Arc::new(ShipmentLookup::new(Arc::new(client))));
            }
            Some("ticket") => {
                let platform = platform.clone().ok_or_else(|| {
                    HiveError::Config("ticket capability requires crm credentials".to_string())
                })?;
                factory = factory.with_capability("ticket", Arc::new(CreateTicket::new(platform)));
            }
            _ => {}
        }
    }
    let factory = factory.load_prompts(&roster)?;

    let detector = TerminationDetector::new(
        cfg.orchestrator.max_messages,
        cfg.orchestrator.markers.clone(),
    );
    let settings = OrchestratorSettings::from_section(&cfg.orchestrator)
        .with_fallback_reply(cfg.app.failure_reply.clone());
    let orchestrator = Arc::new(TurnOrchestrator::new(
        store,
        roster,
        Arc::new(factory),
        detector,
        settings,
    ));

    let notifier = Arc::new(NotificationHub::new());

    let pipeline = match (cfg.webhook.enabled, platform) {
        (true, Some(platform)) => Some(Arc::new(
            WebhookPipeline::new(
                Arc::clone(&orchestrator),
                platform,
                Arc::clone(&notifier),
                DedupGuard::in_memory(Duration::from_secs(cfg.webhook.completed_ttl_secs)),
                Arc::clone(&shutdown),
            )
            .with_subscription_types(cfg.webhook.subscription_types.clone())
            .with_reply_mode(cfg.crm.reply_mode)
            .with_ack_reply(cfg.app.ack_reply.clone()),
        )),
        (true, None) => {
            return Err(HiveError::Config(
                "webhook is enabled but crm credentials are missing".to_string(),
            ))
        }
        (false, _) => None,
    };

    tracing::info!(
        app = %cfg.app.name,
        workers = orchestrator.roster().actors().count(),
        webhook = pipeline.is_some(),
        "Components created"
    );

    Ok(AppComponents {
        orchestrator,
        notifier,
        pipeline,
        shutdown,
    })
}
