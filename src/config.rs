use std::env;
use std::time::Duration;

use chrono_tz::Tz;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationDeliveryMode {
    Outbox,
    Direct,
}

impl NotificationDeliveryMode {
    fn from_env(value: Option<String>) -> Self {
        match value
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "direct" => Self::Direct,
            _ => Self::Outbox,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outbox => "outbox",
            Self::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub database_url: Option<String>,
    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
    pub db_pool_acquire_timeout_seconds: u64,
    pub db_pool_idle_timeout_seconds: u64,
    pub scheduler_timezone: Tz,
    pub scheduler_daily_run_hour: u32,
    pub scheduler_poll_interval_seconds: u64,
    pub scheduler_max_concurrency: usize,
    pub scheduler_shutdown_grace_seconds: u64,
    pub run_once_timeout_seconds: u64,
    pub late_escalation_days: i64,
    pub notification_delivery_mode: NotificationDeliveryMode,
    pub whatsapp_phone_number_id: Option<String>,
    pub whatsapp_access_token: Option<String>,
    pub resend_api_key: Option<String>,
    pub email_from_address: String,
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_phone_number: Option<String>,
    pub app_public_url: String,
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        let timezone_name = env_or("SCHEDULER_TIMEZONE", "America/Asuncion");
        let scheduler_timezone = timezone_name.parse::<Tz>().map_err(|_| {
            AppError::Config(format!("Unknown SCHEDULER_TIMEZONE '{timezone_name}'."))
        })?;

        Ok(Self {
            app_name: env_or("APP_NAME", "Rent Ledger Worker"),
            environment: env_or("ENVIRONMENT", "development"),
            database_url: env_opt("SUPABASE_DB_URL").or_else(|| env_opt("DATABASE_URL")),
            db_pool_max_connections: env_parse_or("DB_POOL_MAX_CONNECTIONS", 5),
            db_pool_min_connections: env_parse_or("DB_POOL_MIN_CONNECTIONS", 1),
            db_pool_acquire_timeout_seconds: env_parse_or("DB_POOL_ACQUIRE_TIMEOUT_SECONDS", 5),
            db_pool_idle_timeout_seconds: env_parse_or("DB_POOL_IDLE_TIMEOUT_SECONDS", 600),
            scheduler_timezone,
            scheduler_daily_run_hour: env_parse_or("SCHEDULER_DAILY_RUN_HOUR", 8_u32).min(23),
            scheduler_poll_interval_seconds: env_parse_or("SCHEDULER_POLL_INTERVAL_SECONDS", 15_u64)
                .max(1),
            scheduler_max_concurrency: env_parse_or("SCHEDULER_MAX_CONCURRENCY", 8_usize).max(1),
            scheduler_shutdown_grace_seconds: env_parse_or("SCHEDULER_SHUTDOWN_GRACE_SECONDS", 30),
            run_once_timeout_seconds: env_parse_or("RUN_ONCE_TIMEOUT_SECONDS", 600_u64).max(1),
            late_escalation_days: env_parse_or("LATE_ESCALATION_DAYS", 7_i64).max(1),
            notification_delivery_mode: NotificationDeliveryMode::from_env(env_opt(
                "NOTIFICATION_DELIVERY_MODE",
            )),
            whatsapp_phone_number_id: env_opt("WHATSAPP_PHONE_NUMBER_ID"),
            whatsapp_access_token: env_opt("WHATSAPP_ACCESS_TOKEN"),
            resend_api_key: env_opt("RESEND_API_KEY"),
            email_from_address: env_or("EMAIL_FROM_ADDRESS", "noreply@casaora.co"),
            twilio_account_sid: env_opt("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: env_opt("TWILIO_AUTH_TOKEN"),
            twilio_phone_number: env_opt("TWILIO_PHONE_NUMBER"),
            app_public_url: normalize_public_url(&env_or("APP_PUBLIC_URL", "http://localhost:3000")),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_poll_interval_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.scheduler_shutdown_grace_seconds)
    }

    pub fn run_once_timeout(&self) -> Duration {
        Duration::from_secs(self.run_once_timeout_seconds)
    }

    pub fn direct_delivery_configured(&self) -> bool {
        let whatsapp =
            self.whatsapp_phone_number_id.is_some() && self.whatsapp_access_token.is_some();
        let sms = self.twilio_account_sid.is_some()
            && self.twilio_auth_token.is_some()
            && self.twilio_phone_number.is_some();
        whatsapp || sms || self.resend_api_key.is_some()
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn normalize_public_url(raw: &str) -> String {
    let mut url = raw.trim().to_string();
    while url.ends_with('/') {
        url.pop();
    }
    if url.is_empty() {
        return "http://localhost:3000".to_string();
    }
    url
}
