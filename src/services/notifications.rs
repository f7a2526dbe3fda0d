use std::future::Future;

use chrono::{NaiveDate, Utc};
use reqwest::Client;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::{
    config::AppConfig,
    repository::table_service::create_row,
    schemas::{Recipient, RecipientRole},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    RentDueSoon,
    RentDueToday,
    RentLate,
    LateEscalation,
    OwnerLateAlert,
    LeaseExpiry { days: i64 },
}

impl NotificationKind {
    /// Stable identifier used for dedup markers and `reminder_type`.
    pub fn key(self) -> String {
        match self {
            Self::RentDueSoon => "rent_due_soon".to_string(),
            Self::RentDueToday => "rent_due_today".to_string(),
            Self::RentLate => "rent_late".to_string(),
            Self::LateEscalation => "rent_late_escalation".to_string(),
            Self::OwnerLateAlert => "owner_late_alert".to_string(),
            Self::LeaseExpiry { days } => format!("lease_expiry_{days}d"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeLine {
    pub label: String,
    pub amount: i64,
}

/// What a message is about. Amounts are in minor currency units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationContext {
    pub organization_id: Option<String>,
    pub lease_id: String,
    pub rent_payment_id: Option<String>,
    pub property_id: Option<String>,
    pub unit_id: Option<String>,
    pub tenant_name: String,
    pub amount: i64,
    pub late_fee: i64,
    pub currency: String,
    pub due_date: Option<NaiveDate>,
    pub ends_on: Option<NaiveDate>,
    pub days_late: Option<i64>,
    pub days_remaining: Option<i64>,
    pub charges: Vec<ChargeLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Whatsapp,
    Sms,
    Email,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub channel: Channel,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("recipient has no phone or email")]
    NoChannel,
    #[error("{0} not configured")]
    NotConfigured(&'static str),
    #[error("provider rejected message: {0}")]
    Rejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Sends one notification and reports the outcome instead of panicking.
pub trait NotificationGateway: Send + Sync + 'static {
    fn send_reminder(
        &self,
        recipient: &Recipient,
        kind: NotificationKind,
        context: &NotificationContext,
    ) -> impl Future<Output = Result<DeliveryReceipt, DeliveryError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

pub fn render_message(
    kind: NotificationKind,
    recipient: &Recipient,
    context: &NotificationContext,
    app_public_url: &str,
) -> RenderedMessage {
    let name = &recipient.name;
    let tenant_name = &context.tenant_name;
    let amount_display = format_amount(context.amount, &context.currency);
    let due = context
        .due_date
        .map(|date| date.to_string())
        .unwrap_or_default();
    let breakdown = render_breakdown(&context.charges, &context.currency);

    match kind {
        NotificationKind::RentDueSoon => RenderedMessage {
            subject: "Recordatorio de pago de alquiler".to_string(),
            body: format!(
                "Hola {name} 👋\n\n\
                 Te recordamos que tu pago de alquiler de {amount_display} vence el {due}.\n\
                 {breakdown}\n\
                 Puedes ver los detalles y realizar tu pago en:\n\
                 {app_public_url}/tenant/payments\n\n\
                 Gracias por tu puntualidad.\n\
                 — Casaora"
            ),
        },
        NotificationKind::RentDueToday => RenderedMessage {
            subject: "Tu pago de alquiler vence hoy".to_string(),
            body: format!(
                "⚠️ {name}, hoy vence tu pago de alquiler de {amount_display}.\n\
                 {breakdown}\n\
                 Por favor realiza tu pago hoy para evitar recargos.\n\
                 {app_public_url}/tenant/payments\n\n\
                 — Casaora"
            ),
        },
        NotificationKind::RentLate => {
            let fee_line = if context.late_fee > 0 {
                format!(
                    "Se aplicó un recargo por mora de {}.\n",
                    format_amount(context.late_fee, &context.currency)
                )
            } else {
                String::new()
            };
            RenderedMessage {
                subject: "Pago de alquiler atrasado".to_string(),
                body: format!(
                    "🔴 {name}, tu pago de {amount_display} (vencimiento: {due}) está atrasado.\n\
                     {fee_line}\n\
                     Por favor regulariza tu situación lo antes posible.\n\
                     {app_public_url}/tenant/payments\n\n\
                     Si ya realizaste el pago, envía tu comprobante.\n\
                     — Casaora"
                ),
            }
        }
        NotificationKind::LateEscalation => {
            let days_late = context.days_late.unwrap_or_default();
            RenderedMessage {
                subject: "URGENTE: pago de alquiler atrasado".to_string(),
                body: format!(
                    "🚨 URGENTE — {name}\n\n\
                     Tu pago de {amount_display} (vencimiento: {due}) lleva {days_late} días de atraso.\n\n\
                     Debes regularizar tu situación de forma inmediata para evitar acciones adicionales.\n\
                     {app_public_url}/tenant/payments\n\n\
                     Contacta a tu administrador si necesitas coordinar un plan de pago.\n\
                     — Casaora"
                ),
            }
        }
        NotificationKind::OwnerLateAlert => {
            let days_late = context.days_late.unwrap_or_default();
            RenderedMessage {
                subject: "Alerta de cobro".to_string(),
                body: format!(
                    "⚠️ Alerta de cobro — El inquilino {tenant_name} tiene un pago de {amount_display} \
                     con {days_late} días de atraso (vencimiento: {due}).\n\n\
                     Revisa el estado en tu panel de administración.\n\
                     {app_public_url}/module/collections\n\
                     — Casaora"
                ),
            }
        }
        NotificationKind::LeaseExpiry { days } => {
            let ends_on = context
                .ends_on
                .map(|date| date.to_string())
                .unwrap_or_default();
            match recipient.role {
                RecipientRole::Tenant => RenderedMessage {
                    subject: "Tu contrato está por vencer".to_string(),
                    body: format!(
                        "📋 Hola {name}, tu contrato de alquiler vence en {days} días ({ends_on}).\n\n\
                         Por favor contacta a tu administrador sobre la renovación.\n\
                         — Casaora"
                    ),
                },
                RecipientRole::Manager => RenderedMessage {
                    subject: "Contrato por vencer".to_string(),
                    body: format!(
                        "📋 Contrato por vencer\n\n\
                         El contrato de {tenant_name} vence en {days} días ({ends_on}).\n\
                         Renta actual: {amount_display}/mes\n\n\
                         Envía una oferta de renovación desde tu panel.\n\
                         {app_public_url}/module/leases"
                    ),
                },
            }
        }
    }
}

fn render_breakdown(charges: &[ChargeLine], currency: &str) -> String {
    if charges.is_empty() {
        return String::new();
    }
    let mut lines = String::from("\nDetalle:\n");
    for charge in charges {
        lines.push_str(&format!(
            "• {}: {}\n",
            charge.label,
            format_amount(charge.amount, currency)
        ));
    }
    lines
}

/// Format an amount given in minor units. PYG has no minor unit.
pub fn format_amount(minor_units: i64, currency: &str) -> String {
    let sign = if minor_units < 0 { "-" } else { "" };
    let magnitude = minor_units.unsigned_abs();
    match currency {
        "PYG" => format!("{sign}₲{}", group_digits(magnitude, '.')),
        "USD" => format!(
            "{sign}${}.{:02}",
            group_digits(magnitude / 100, ','),
            magnitude % 100
        ),
        _ => format!("{sign}{}.{:02} {currency}", magnitude / 100, magnitude % 100),
    }
}

fn group_digits(value: u64, separator: char) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(separator);
        }
        grouped.push(digit);
    }
    grouped
}

/// Phone numbers win over email, matching how tenants are reached today.
pub fn preferred_channel(recipient: &Recipient) -> Option<(Channel, &str)> {
    if let Some(phone) = recipient.phone_e164.as_deref() {
        return Some((Channel::Whatsapp, phone));
    }
    recipient
        .email
        .as_deref()
        .map(|email| (Channel::Email, email))
}

/// Queues messages into `message_logs`; the messaging worker delivers them.
#[derive(Debug, Clone)]
pub struct OutboxGateway {
    pool: sqlx::PgPool,
    app_public_url: String,
}

impl OutboxGateway {
    pub fn new(pool: sqlx::PgPool, app_public_url: &str) -> Self {
        Self {
            pool,
            app_public_url: app_public_url.to_string(),
        }
    }
}

pub fn outbox_row(
    channel: Channel,
    address: &str,
    kind: NotificationKind,
    context: &NotificationContext,
    message: RenderedMessage,
) -> Map<String, Value> {
    let mut msg = Map::new();
    if let Some(org_id) = context.organization_id.as_deref() {
        msg.insert(
            "organization_id".to_string(),
            Value::String(org_id.to_string()),
        );
    }
    msg.insert(
        "channel".to_string(),
        Value::String(channel.as_str().to_string()),
    );
    msg.insert("recipient".to_string(), Value::String(address.to_string()));
    msg.insert("status".to_string(), Value::String("queued".to_string()));
    msg.insert(
        "scheduled_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );

    let mut payload = Map::new();
    payload.insert("body".to_string(), Value::String(message.body));
    payload.insert("subject".to_string(), Value::String(message.subject));
    payload.insert("reminder_type".to_string(), Value::String(kind.key()));
    payload.insert(
        "lease_id".to_string(),
        Value::String(context.lease_id.clone()),
    );
    if let Some(payment_id) = context.rent_payment_id.as_deref() {
        payload.insert(
            "rent_payment_id".to_string(),
            Value::String(payment_id.to_string()),
        );
    }
    msg.insert("payload".to_string(), Value::Object(payload));
    msg
}

impl NotificationGateway for OutboxGateway {
    async fn send_reminder(
        &self,
        recipient: &Recipient,
        kind: NotificationKind,
        context: &NotificationContext,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let (channel, address) = preferred_channel(recipient).ok_or(DeliveryError::NoChannel)?;
        let message = render_message(kind, recipient, context, &self.app_public_url);
        let row = outbox_row(channel, address, kind, context, message);

        let created = create_row(&self.pool, "message_logs", &row)
            .await
            .map_err(|error| DeliveryError::Transport(error.to_string()))?;

        Ok(DeliveryReceipt {
            channel,
            reference: created
                .get("id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        })
    }
}

/// Calls WhatsApp Cloud API, Twilio and Resend directly.
#[derive(Debug, Clone)]
pub struct DirectGateway {
    http_client: Client,
    config: AppConfig,
}

impl DirectGateway {
    pub fn new(http_client: Client, config: AppConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    async fn send_whatsapp(&self, phone: &str, body: &str) -> Result<Option<String>, DeliveryError> {
        let phone_id = self
            .config
            .whatsapp_phone_number_id
            .as_deref()
            .ok_or(DeliveryError::NotConfigured("WHATSAPP_PHONE_NUMBER_ID"))?;
        let access_token = self
            .config
            .whatsapp_access_token
            .as_deref()
            .ok_or(DeliveryError::NotConfigured("WHATSAPP_ACCESS_TOKEN"))?;

        let url = format!("https://graph.facebook.com/v21.0/{phone_id}/messages");
        let payload = json!({
            "messaging_product": "whatsapp",
            "to": phone,
            "type": "text",
            "text": { "body": body }
        });

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|error| DeliveryError::Transport(error.to_string()))?;

        let status = response.status();
        let resp_body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| json!({"error": "failed to parse response"}));

        if status.is_success() {
            Ok(resp_body
                .pointer("/messages/0/id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned))
        } else {
            let error_msg = resp_body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown WhatsApp API error");
            Err(DeliveryError::Rejected(format!(
                "WhatsApp API error ({status}): {error_msg}"
            )))
        }
    }

    async fn send_sms(&self, phone: &str, body: &str) -> Result<Option<String>, DeliveryError> {
        let account_sid = self
            .config
            .twilio_account_sid
            .as_deref()
            .ok_or(DeliveryError::NotConfigured("TWILIO_ACCOUNT_SID"))?;
        let auth_token = self
            .config
            .twilio_auth_token
            .as_deref()
            .ok_or(DeliveryError::NotConfigured("TWILIO_AUTH_TOKEN"))?;
        let from_number = self
            .config
            .twilio_phone_number
            .as_deref()
            .ok_or(DeliveryError::NotConfigured("TWILIO_PHONE_NUMBER"))?;

        let url =
            format!("https://api.twilio.com/2010-04-01/Accounts/{account_sid}/Messages.json");

        let response = self
            .http_client
            .post(&url)
            .basic_auth(account_sid, Some(auth_token))
            .form(&[("To", phone), ("From", from_number), ("Body", body)])
            .send()
            .await
            .map_err(|error| DeliveryError::Transport(error.to_string()))?;

        let status = response.status();
        let resp_body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| json!({"error": "failed to parse response"}));

        if status.is_success() {
            Ok(resp_body
                .get("sid")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned))
        } else {
            let error_msg = resp_body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown Twilio API error");
            Err(DeliveryError::Rejected(format!(
                "Twilio API error ({status}): {error_msg}"
            )))
        }
    }

    async fn send_email(
        &self,
        email: &str,
        message: &RenderedMessage,
    ) -> Result<Option<String>, DeliveryError> {
        let api_key = self
            .config
            .resend_api_key
            .as_deref()
            .ok_or(DeliveryError::NotConfigured("RESEND_API_KEY"))?;

        let payload = json!({
            "from": self.config.email_from_address,
            "to": [email],
            "subject": message.subject,
            "text": message.body,
        });

        let response = self
            .http_client
            .post("https://api.resend.com/emails")
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|error| DeliveryError::Transport(error.to_string()))?;

        let status = response.status();
        let resp_body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| json!({"error": "failed to parse response"}));

        if status.is_success() {
            Ok(resp_body
                .get("id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned))
        } else {
            let error_msg = resp_body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown Resend API error");
            Err(DeliveryError::Rejected(format!(
                "Resend API error ({status}): {error_msg}"
            )))
        }
    }
}

impl NotificationGateway for DirectGateway {
    async fn send_reminder(
        &self,
        recipient: &Recipient,
        kind: NotificationKind,
        context: &NotificationContext,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let message = render_message(kind, recipient, context, &self.config.app_public_url);
        let mut last_error = DeliveryError::NoChannel;

        if let Some(phone) = recipient.phone_e164.as_deref() {
            match self.send_whatsapp(phone, &message.body).await {
                Ok(reference) => {
                    return Ok(DeliveryReceipt {
                        channel: Channel::Whatsapp,
                        reference,
                    })
                }
                Err(error) => last_error = error,
            }
            match self.send_sms(phone, &message.body).await {
                Ok(reference) => {
                    return Ok(DeliveryReceipt {
                        channel: Channel::Sms,
                        reference,
                    })
                }
                Err(DeliveryError::NotConfigured(_)) => {}
                Err(error) => last_error = error,
            }
        }

        if let Some(email) = recipient.email.as_deref() {
            match self.send_email(email, &message).await {
                Ok(reference) => {
                    return Ok(DeliveryReceipt {
                        channel: Channel::Email,
                        reference,
                    })
                }
                Err(DeliveryError::NotConfigured(_))
                    if !matches!(last_error, DeliveryError::NoChannel) => {}
                Err(error) => last_error = error,
            }
        }

        Err(last_error)
    }
}

/// The gateway picked by `NOTIFICATION_DELIVERY_MODE`.
#[derive(Debug, Clone)]
pub enum ConfiguredGateway {
    Outbox(OutboxGateway),
    Direct(DirectGateway),
}

impl NotificationGateway for ConfiguredGateway {
    async fn send_reminder(
        &self,
        recipient: &Recipient,
        kind: NotificationKind,
        context: &NotificationContext,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        match self {
            Self::Outbox(gateway) => gateway.send_reminder(recipient, kind, context).await,
            Self::Direct(gateway) => gateway.send_reminder(recipient, kind, context).await,
        }
    }
}


#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::Value;

    use super::{
        format_amount, outbox_row, preferred_channel, render_message, Channel, ChargeLine,
        NotificationContext, NotificationKind,
    };
    use crate::schemas::{Recipient, RecipientRole};

    fn tenant(phone: Option<&str>, email: Option<&str>) -> Recipient {
        Recipient {
            role: RecipientRole::Tenant,
            name: "Ana".to_string(),
            phone_e164: phone.map(ToOwned::to_owned),
            email: email.map(ToOwned::to_owned),
        }
    }

    fn context() -> NotificationContext {
        NotificationContext {
            organization_id: Some("org-1".to_string()),
            lease_id: "lease-1".to_string(),
            rent_payment_id: Some("pay-1".to_string()),
            tenant_name: "Ana".to_string(),
            amount: 155_000,
            late_fee: 5_000,
            currency: "USD".to_string(),
            due_date: NaiveDate::from_ymd_opt(2026, 3, 1),
            charges: vec![ChargeLine {
                label: "Expensas".to_string(),
                amount: 20_000,
            }],
            ..NotificationContext::default()
        }
    }

    #[test]
    fn formats_minor_units_per_currency() {
        assert_eq!(format_amount(2_500_000, "PYG"), "₲2.500.000");
        assert_eq!(format_amount(150_000, "USD"), "$1,500.00");
        assert_eq!(format_amount(5, "USD"), "$0.05");
        assert_eq!(format_amount(123_456, "EUR"), "1234.56 EUR");
        assert_eq!(format_amount(-5_000, "PYG"), "-₲5.000");
    }

    #[test]
    fn marker_keys_are_stable() {
        assert_eq!(NotificationKind::RentDueSoon.key(), "rent_due_soon");
        assert_eq!(NotificationKind::RentLate.key(), "rent_late");
        assert_eq!(
            NotificationKind::LeaseExpiry { days: 14 }.key(),
            "lease_expiry_14d"
        );
    }

    #[test]
    fn phone_wins_over_email() {
        let both = tenant(Some("+595981000000"), Some("ana@example.com"));
        assert_eq!(
            preferred_channel(&both),
            Some((Channel::Whatsapp, "+595981000000"))
        );
        let email_only = tenant(None, Some("ana@example.com"));
        assert_eq!(
            preferred_channel(&email_only),
            Some((Channel::Email, "ana@example.com"))
        );
        assert_eq!(preferred_channel(&tenant(None, None)), None);
    }

    #[test]
    fn late_notice_mentions_fee_and_link() {
        let message = render_message(
            NotificationKind::RentLate,
            &tenant(Some("+595981000000"), None),
            &context(),
            "https://app.casaora.co",
        );
        assert!(message.body.contains("$1,550.00"));
        assert!(message.body.contains("2026-03-01"));
        assert!(message.body.contains("recargo por mora de $50.00"));
        assert!(message.body.contains("https://app.casaora.co/tenant/payments"));
    }

    #[test]
    fn due_soon_itemizes_charges() {
        let message = render_message(
            NotificationKind::RentDueSoon,
            &tenant(Some("+595981000000"), None),
            &context(),
            "https://app.casaora.co",
        );
        assert!(message.body.contains("• Expensas: $200.00"));
    }

    #[test]
    fn expiry_message_depends_on_role() {
        let ctx = NotificationContext {
            ends_on: NaiveDate::from_ymd_opt(2026, 4, 30),
            ..context()
        };
        let manager = Recipient {
            role: RecipientRole::Manager,
            name: "Luis".to_string(),
            phone_e164: Some("+595981111111".to_string()),
            email: None,
        };
        let kind = NotificationKind::LeaseExpiry { days: 30 };

        let for_manager = render_message(kind, &manager, &ctx, "https://app.casaora.co");
        assert!(for_manager.body.contains("El contrato de Ana vence en 30 días"));
        assert!(for_manager.body.contains("/module/leases"));

        let for_tenant = render_message(kind, &tenant(None, None), &ctx, "https://app.casaora.co");
        assert!(for_tenant.body.contains("Hola Ana, tu contrato"));
    }

    #[test]
    fn outbox_row_carries_reminder_type() {
        let ctx = context();
        let message = render_message(
            NotificationKind::RentDueToday,
            &tenant(Some("+595981000000"), None),
            &ctx,
            "https://app.casaora.co",
        );
        let row = outbox_row(
            Channel::Whatsapp,
            "+595981000000",
            NotificationKind::RentDueToday,
            &ctx,
            message,
        );

        assert_eq!(row.get("status").and_then(Value::as_str), Some("queued"));
        assert_eq!(row.get("channel").and_then(Value::as_str), Some("whatsapp"));
        let payload = row.get("payload").expect("payload");
        assert_eq!(
            payload.get("reminder_type").and_then(Value::as_str),
            Some("rent_due_today")
        );
        assert_eq!(
            payload.get("rent_payment_id").and_then(Value::as_str),
            Some("pay-1")
        );
    }
}
