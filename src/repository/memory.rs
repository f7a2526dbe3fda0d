//! In-memory ledger used by the scheduler and dispatcher tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    repository::ledger_store::{LedgerStore, RowResult},
    schemas::{decode_row, Lease, LeaseCharge, PaymentStatus, Recipient, RentPayment},
};

#[derive(Debug, Default)]
struct State {
    leases: Vec<Value>,
    payments: Vec<Value>,
    charges: Vec<LeaseCharge>,
    managers: HashMap<String, Vec<Recipient>>,
    markers: HashSet<(String, String, NaiveDate)>,
    writes: Vec<(String, PaymentStatus, i64)>,
    unreachable: bool,
    failing_updates: HashSet<String>,
    after_listing: Vec<(String, PaymentStatus)>,
}

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<State>,
}

impl MemoryLedgerStore {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_lease(&self, row: Value) {
        self.state().leases.push(row);
    }

    pub fn insert_payment(&self, row: Value) {
        self.state().payments.push(row);
    }

    pub fn insert_charge(&self, charge: LeaseCharge) {
        self.state().charges.push(charge);
    }

    pub fn insert_manager(&self, organization_id: &str, contact: Recipient) {
        self.state()
            .managers
            .entry(organization_id.to_string())
            .or_default()
            .push(contact);
    }

    /// Record a payment made outside the worker.
    pub fn record_payment(&self, payment_id: &str, amount_paid: i64) {
        let mut state = self.state();
        if let Some(row) = find_payment(&mut state.payments, payment_id) {
            row["amount_paid"] = json!(amount_paid);
        }
    }

    /// Apply `status` right after the next payment listing returns, as a
    /// manager or payment recorder would between the worker's read and write.
    pub fn set_status_after_listing(&self, payment_id: &str, status: PaymentStatus) {
        self.state()
            .after_listing
            .push((payment_id.to_string(), status));
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn fail_updates_for(&self, payment_id: &str) {
        self.state().failing_updates.insert(payment_id.to_string());
    }

    pub fn payment(&self, payment_id: &str) -> RentPayment {
        let state = self.state();
        let row = state
            .payments
            .iter()
            .find(|row| row["id"] == payment_id)
            .cloned()
            .expect("payment exists");
        decode_row("rent_payments", row).expect("payment decodes")
    }

    pub fn writes(&self) -> Vec<(String, PaymentStatus, i64)> {
        self.state().writes.clone()
    }

    pub fn has_marker(&self, entity_id: &str, kind: &str, day: NaiveDate) -> bool {
        self.state()
            .markers
            .contains(&(entity_id.to_string(), kind.to_string(), day))
    }

    fn ensure_reachable(&self) -> AppResult<()> {
        if self.state().unreachable {
            return Err(AppError::Dependency(
                "Database operation failed.".to_string(),
            ));
        }
        Ok(())
    }
}

/// An active lease for tenant "Ana" with a 5 day grace period and a 5000 fee.
pub fn lease_row(lease_id: &str) -> Value {
    json!({
        "id": lease_id,
        "organization_id": "org-1",
        "property_id": "prop-1",
        "unit_id": "unit-1",
        "tenant_full_name": "Ana",
        "tenant_phone_e164": "+595981000000",
        "lease_status": "active",
        "starts_on": "2026-01-01",
        "ends_on": "2027-12-31",
        "currency": "USD",
        "monthly_rent": 150000,
        "late_fee_amount": 5000,
        "late_fee_grace_days": 5
    })
}

/// An unpaid 150000 rent payment for the month ending on `due_date`.
pub fn payment_row(payment_id: &str, lease_id: &str, due_date: NaiveDate) -> Value {
    json!({
        "id": payment_id,
        "lease_id": lease_id,
        "organization_id": "org-1",
        "period_start": due_date,
        "period_end": due_date + chrono::Days::new(30),
        "due_date": due_date,
        "amount_due": 150000,
        "amount_paid": 0,
        "late_fee": 0,
        "status": "upcoming"
    })
}

fn find_payment<'a>(payments: &'a mut [Value], payment_id: &str) -> Option<&'a mut Value> {
    payments.iter_mut().find(|row| row["id"] == payment_id)
}

impl LedgerStore for MemoryLedgerStore {
    async fn list_active_leases(&self) -> AppResult<Vec<RowResult<Lease>>> {
        self.ensure_reachable()?;
        let rows = self
            .state()
            .leases
            .iter()
            .filter(|row| row["lease_status"] == "active")
            .cloned()
            .collect::<Vec<_>>();
        Ok(rows
            .into_iter()
            .map(|row| decode_row("leases", row))
            .collect())
    }

    async fn list_open_rent_payments(
        &self,
        lease_id: &str,
    ) -> AppResult<Vec<RowResult<RentPayment>>> {
        self.ensure_reachable()?;
        let open = PaymentStatus::OPEN.map(PaymentStatus::as_str);
        let mut state = self.state();
        let rows = state
            .payments
            .iter()
            .filter(|row| row["lease_id"] == lease_id)
            .filter(|row| {
                row["status"]
                    .as_str()
                    .map_or(true, |status| open.contains(&status))
            })
            .cloned()
            .collect::<Vec<_>>();
        for (payment_id, status) in std::mem::take(&mut state.after_listing) {
            if let Some(row) = find_payment(&mut state.payments, &payment_id) {
                row["status"] = json!(status.as_str());
            }
        }
        drop(state);
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
        self.ensure_reachable()?;
        let mut state = self.state();
        if state.failing_updates.contains(payment_id) {
            return Err(AppError::Dependency(
                "Database operation failed.".to_string(),
            ));
        }
        let Some(row) = find_payment(&mut state.payments, payment_id) else {
            return Ok(false);
        };
        if row["status"] != expected_status.as_str() || row["late_fee"].as_i64() != expected_late_fee {
            return Ok(false);
        }
        row["status"] = json!(status.as_str());
        row["late_fee"] = json!(late_fee);
        state
            .writes
            .push((payment_id.to_string(), status, late_fee));
        Ok(true)
    }

    async fn mark_notified(&self, entity_id: &str, kind: &str, day: NaiveDate) -> AppResult<bool> {
        self.ensure_reachable()?;
        Ok(self
            .state()
            .markers
            .insert((entity_id.to_string(), kind.to_string(), day)))
    }

    async fn clear_notified(&self, entity_id: &str, kind: &str, day: NaiveDate) -> AppResult<()> {
        self.ensure_reachable()?;
        self.state()
            .markers
            .remove(&(entity_id.to_string(), kind.to_string(), day));
        Ok(())
    }

    async fn list_lease_charges(&self, lease_id: &str) -> AppResult<Vec<LeaseCharge>> {
        self.ensure_reachable()?;
        Ok(self
            .state()
            .charges
            .iter()
            .filter(|charge| charge.lease_id == lease_id)
            .cloned()
            .collect())
    }

    async fn list_manager_contacts(&self, organization_id: &str) -> AppResult<Vec<Recipient>> {
        self.ensure_reachable()?;
        Ok(self
            .state()
            .managers
            .get(organization_id)
            .cloned()
            .unwrap_or_default())
    }
}
