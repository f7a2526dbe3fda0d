use std::future::Future;

use chrono::NaiveDate;
use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{get_row, list_all_rows, list_rows, update_row, ListOptions},
    schemas::{
        decode_row, non_empty, Lease, LeaseCharge, PaymentStatus, Recipient, RecipientRole,
        RentPayment,
    },
};

/// A row that either decoded into `T` or failed with a data error.
pub type RowResult<T> = Result<T, AppError>;

/// Everything the scheduler reads from and writes to the rent ledger.
///
/// Listing methods fail only when the store itself is unreachable; a single
/// malformed row comes back as an `Err` entry so callers can skip it.
pub trait LedgerStore: Send + Sync + 'static {
    fn list_active_leases(&self) -> impl Future<Output = AppResult<Vec<RowResult<Lease>>>> + Send;

    fn list_open_rent_payments(
        &self,
        lease_id: &str,
    ) -> impl Future<Output = AppResult<Vec<RowResult<RentPayment>>>> + Send;

    /// Compare-and-set write of status and fee. Returns `false`, writing
    /// nothing, when the stored status or raw `late_fee` no longer match what
    /// was read.
    fn update_payment_status(
        &self,
        payment_id: &str,
        expected_status: PaymentStatus,
        expected_late_fee: Option<i64>,
        status: PaymentStatus,
        late_fee: i64,
    ) -> impl Future<Output = AppResult<bool>> + Send;

    /// Returns `false` when the marker already existed.
    fn mark_notified(
        &self,
        entity_id: &str,
        kind: &str,
        day: NaiveDate,
    ) -> impl Future<Output = AppResult<bool>> + Send;

    fn clear_notified(
        &self,
        entity_id: &str,
        kind: &str,
        day: NaiveDate,
    ) -> impl Future<Output = AppResult<()>> + Send;

    fn list_lease_charges(
        &self,
        lease_id: &str,
    ) -> impl Future<Output = AppResult<Vec<LeaseCharge>>> + Send;

    fn list_manager_contacts(
        &self,
        organization_id: &str,
    ) -> impl Future<Output = AppResult<Vec<Recipient>>> + Send;
}

const MANAGER_ROLE: &str = "owner_admin";

fn status_guards(expected_status: PaymentStatus, expected_late_fee: Option<i64>) -> Map<String, Value> {
    let mut guards = Map::new();
    guards.insert(
        "status".to_string(),
        Value::String(expected_status.as_str().to_string()),
    );
    match expected_late_fee {
        Some(fee) => guards.insert("late_fee".to_string(), Value::from(fee)),
        None => guards.insert("late_fee__is_null".to_string(), Value::Bool(true)),
    };
    guards
}

#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl LedgerStore for PgLedgerStore {
    async fn list_active_leases(&self) -> AppResult<Vec<RowResult<Lease>>> {
        let mut filters = Map::new();
        filters.insert(
            "lease_status".to_string(),
            Value::String("active".to_string()),
        );

        let rows = list_all_rows(
            &self.pool,
            "leases",
            Some(&filters),
            ListOptions::ordered("ends_on", 500),
        )
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| decode_row("leases", row))
            .collect())
    }

    async fn list_open_rent_payments(
        &self,
        lease_id: &str,
    ) -> AppResult<Vec<RowResult<RentPayment>>> {
        let mut filters = Map::new();
        filters.insert("lease_id".to_string(), Value::String(lease_id.to_string()));
        filters.insert(
            "status__in".to_string(),
            Value::Array(
                PaymentStatus::OPEN
                    .iter()
                    .map(|status| Value::String(status.as_str().to_string()))
                    .collect(),
            ),
        );

        let rows = list_all_rows(
            &self.pool,
            "rent_payments",
            Some(&filters),
            ListOptions::ordered("due_date", 200),
        )
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| decode_row("rent_payments", row))
            .collect())
    }

    async fn update_payment_status(
        &self,
        payment_id: &str,
        expected_status: PaymentStatus,
        expected_late_fee: Option<i64>,
        status: PaymentStatus,
        late_fee: i64,
    ) -> AppResult<bool> {
        let mut patch = Map::new();
        patch.insert(
            "status".to_string(),
            Value::String(status.as_str().to_string()),
        );
        patch.insert("late_fee".to_string(), Value::from(late_fee));

        let guards = status_guards(expected_status, expected_late_fee);
        let updated = update_row(
            &self.pool,
            "rent_payments",
            payment_id,
            &patch,
            "id",
            Some(&guards),
        )
        .await?;
        Ok(updated.is_some())
    }

    async fn mark_notified(&self, entity_id: &str, kind: &str, day: NaiveDate) -> AppResult<bool> {
        let inserted = sqlx::query(
            "INSERT INTO notification_markers (entity_id, kind, marker_day)
             VALUES ($1, $2, $3)
             ON CONFLICT (entity_id, kind, marker_day) DO NOTHING
             RETURNING 1",
        )
        .bind(entity_id)
        .bind(kind)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted.is_some())
    }

    async fn clear_notified(&self, entity_id: &str, kind: &str, day: NaiveDate) -> AppResult<()> {
        sqlx::query(
            "DELETE FROM notification_markers
             WHERE entity_id = $1 AND kind = $2 AND marker_day = $3",
        )
        .bind(entity_id)
        .bind(kind)
        .bind(day)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_lease_charges(&self, lease_id: &str) -> AppResult<Vec<LeaseCharge>> {
        let mut filters = Map::new();
        filters.insert("lease_id".to_string(), Value::String(lease_id.to_string()));

        let rows = list_rows(
            &self.pool,
            "lease_charges",
            Some(&filters),
            ListOptions::ordered("charge_date", 200),
        )
        .await?;

        rows.into_iter()
            .map(|row| decode_row("lease_charges", row))
            .collect()
    }

    async fn list_manager_contacts(&self, organization_id: &str) -> AppResult<Vec<Recipient>> {
        let mut filters = Map::new();
        filters.insert(
            "organization_id".to_string(),
            Value::String(organization_id.to_string()),
        );
        filters.insert("role".to_string(), Value::String(MANAGER_ROLE.to_string()));

        let members = list_rows(
            &self.pool,
            "organization_members",
            Some(&filters),
            ListOptions::ordered("created_at", 20),
        )
        .await?;

        let mut contacts = Vec::new();
        for member in &members {
            let Some(user_id) = non_empty(member.get("user_id").and_then(Value::as_str)) else {
                continue;
            };
            let user = match get_row(&self.pool, "app_users", &user_id, "id").await {
                Ok(user) => user,
                Err(error) => {
                    tracing::warn!(organization_id, user_id, %error, "Manager contact lookup failed");
                    continue;
                }
            };
            let contact = Recipient {
                role: RecipientRole::Manager,
                name: non_empty(user.get("full_name").and_then(Value::as_str))
                    .unwrap_or_else(|| "administrador".to_string()),
                phone_e164: non_empty(user.get("phone_e164").and_then(Value::as_str)),
                email: non_empty(user.get("email").and_then(Value::as_str)),
            };
            if contact.is_reachable() && !contacts.contains(&contact) {
                contacts.push(contact);
            }
        }

        Ok(contacts)
    }
}
