use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::{
    config::{AppConfig, NotificationDeliveryMode},
    error::{AppError, AppResult},
    services::notifications::{ConfiguredGateway, DirectGateway, OutboxGateway},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub http_client: Client,
}

impl AppState {
    pub fn build(config: AppConfig) -> AppResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|error| AppError::Internal(format!("Could not build HTTP client: {error}")))?;

        let db_pool = match config.database_url.as_deref() {
            Some(url) => Some(
                PgPoolOptions::new()
                    .max_connections(config.db_pool_max_connections.max(1))
                    .min_connections(config.db_pool_min_connections)
                    .acquire_timeout(Duration::from_secs(config.db_pool_acquire_timeout_seconds))
                    .idle_timeout(Duration::from_secs(config.db_pool_idle_timeout_seconds))
                    .connect_lazy(url)?,
            ),
            None => None,
        };

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            http_client,
        })
    }

    pub fn require_pool(&self) -> AppResult<PgPool> {
        self.db_pool.clone().ok_or_else(|| {
            AppError::Config("DATABASE_URL (or SUPABASE_DB_URL) is required.".to_string())
        })
    }

    pub fn notification_gateway(&self) -> AppResult<ConfiguredGateway> {
        match self.config.notification_delivery_mode {
            NotificationDeliveryMode::Outbox => Ok(ConfiguredGateway::Outbox(OutboxGateway::new(
                self.require_pool()?,
                &self.config.app_public_url,
            ))),
            NotificationDeliveryMode::Direct => {
                if !self.config.direct_delivery_configured() {
                    tracing::warn!(
                        "NOTIFICATION_DELIVERY_MODE=direct but no WhatsApp, Twilio or Resend credentials are set"
                    );
                }
                Ok(ConfiguredGateway::Direct(DirectGateway::new(
                    self.http_client.clone(),
                    self.config.as_ref().clone(),
                )))
            }
        }
    }
}
