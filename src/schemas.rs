use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

fn default_currency_pyg() -> String {
    "PYG".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Draft,
    Pending,
    Active,
    Expired,
    Terminated,
    Renewed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Upcoming,
    Due,
    Partial,
    Paid,
    Late,
    Waived,
}

impl PaymentStatus {
    pub const OPEN: [Self; 4] = [Self::Upcoming, Self::Due, Self::Partial, Self::Late];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upcoming => "upcoming",
            Self::Due => "due",
            Self::Partial => "partial",
            Self::Paid => "paid",
            Self::Late => "late",
            Self::Waived => "waived",
        }
    }

    /// `paid` and `waived` never change once reached.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Waived)
    }

    /// Position on the forward-only lifecycle. `waived` sits outside it.
    pub fn lifecycle_rank(self) -> Option<u8> {
        match self {
            Self::Upcoming => Some(0),
            Self::Due => Some(1),
            Self::Partial => Some(2),
            Self::Late => Some(3),
            Self::Paid => Some(4),
            Self::Waived => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Lease {
    pub id: String,
    pub organization_id: Option<String>,
    pub property_id: Option<String>,
    pub unit_id: Option<String>,
    pub tenant_full_name: Option<String>,
    pub tenant_email: Option<String>,
    pub tenant_phone_e164: Option<String>,
    pub lease_status: LeaseStatus,
    pub starts_on: Option<NaiveDate>,
    pub ends_on: Option<NaiveDate>,
    #[serde(default = "default_currency_pyg")]
    pub currency: String,
    #[serde(default)]
    pub monthly_rent: i64,
    pub late_fee_amount: Option<i64>,
    pub late_fee_grace_days: Option<i32>,
}

impl Lease {
    pub fn is_active(&self) -> bool {
        self.lease_status == LeaseStatus::Active
    }

    pub fn tenant_name(&self) -> &str {
        self.tenant_full_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or("inquilino")
    }

    pub fn tenant_recipient(&self) -> Recipient {
        Recipient {
            role: RecipientRole::Tenant,
            name: self.tenant_name().to_string(),
            phone_e164: non_empty(self.tenant_phone_e164.as_deref()),
            email: non_empty(self.tenant_email.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RentPayment {
    pub id: String,
    pub lease_id: String,
    pub organization_id: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub amount_due: Option<i64>,
    pub amount_paid: Option<i64>,
    pub late_fee: Option<i64>,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

impl RentPayment {
    pub fn amount_paid(&self) -> i64 {
        self.amount_paid.unwrap_or(0).max(0)
    }

    pub fn late_fee(&self) -> i64 {
        self.late_fee.unwrap_or(0).max(0)
    }

    /// Rent plus any assessed fee still owed; zero when settled or overpaid.
    pub fn outstanding(&self) -> i64 {
        self.amount_due
            .unwrap_or(0)
            .saturating_add(self.late_fee())
            .saturating_sub(self.amount_paid())
            .max(0)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeaseCharge {
    pub id: String,
    pub lease_id: String,
    pub charge_date: Option<NaiveDate>,
    pub charge_type: String,
    pub description: Option<String>,
    #[serde(default)]
    pub amount: i64,
    #[serde(default = "default_currency_pyg")]
    pub currency: String,
}

impl LeaseCharge {
    pub fn label(&self) -> &str {
        self.description
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .unwrap_or(&self.charge_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRole {
    Tenant,
    Manager,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub role: RecipientRole,
    pub name: String,
    pub phone_e164: Option<String>,
    pub email: Option<String>,
}

impl Recipient {
    pub fn is_reachable(&self) -> bool {
        self.phone_e164.is_some() || self.email.is_some()
    }
}

/// Decode a `row_to_json` row into a typed record.
pub fn decode_row<T: DeserializeOwned>(table: &str, row: Value) -> Result<T, AppError> {
    let row_id = row
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("<no id>")
        .to_string();
    serde_json::from_value(row)
        .map_err(|error| AppError::InvalidRecord(format!("{table} {row_id}: {error}")))
}

pub fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToOwned::to_owned)
}
