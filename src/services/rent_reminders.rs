use chrono::{Days, NaiveDate};
use tracing::warn;

use crate::{
    clock::days_between,
    repository::ledger_store::LedgerStore,
    schemas::{Lease, LeaseCharge, PaymentStatus, RentPayment},
    services::{
        dispatch::{deliver_once, manager_recipients, tenant_recipients, DispatchOutcome},
        notifications::{ChargeLine, NotificationContext, NotificationGateway, NotificationKind},
        payment_status::grace_deadline,
    },
};

pub const DUE_SOON_DAYS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Tenant,
    Managers,
}

/// Notices a payment qualifies for today, before dedup markers are checked.
pub fn reminders_due(
    lease: &Lease,
    payment: &RentPayment,
    today: NaiveDate,
    escalation_days: i64,
) -> Vec<(NotificationKind, Audience)> {
    let mut due = Vec::new();
    if !matches!(
        payment.status,
        PaymentStatus::Upcoming | PaymentStatus::Due | PaymentStatus::Late
    ) {
        return due;
    }
    let Some(due_date) = payment.due_date else {
        return due;
    };

    if due_date.checked_sub_days(Days::new(DUE_SOON_DAYS)) == Some(today) {
        due.push((NotificationKind::RentDueSoon, Audience::Tenant));
    }
    if today == due_date {
        due.push((NotificationKind::RentDueToday, Audience::Tenant));
    }
    if payment.status == PaymentStatus::Late {
        due.push((NotificationKind::RentLate, Audience::Tenant));

        if let Ok(deadline) = grace_deadline(lease, payment) {
            if days_between(deadline, today) >= escalation_days {
                due.push((NotificationKind::LateEscalation, Audience::Tenant));
                due.push((NotificationKind::OwnerLateAlert, Audience::Managers));
            }
        }
    }
    due
}

/// Lease charges falling inside the payment's billing period.
pub fn charges_in_period(payment: &RentPayment, charges: &[LeaseCharge]) -> Vec<ChargeLine> {
    let (Some(start), Some(end)) = (payment.period_start, payment.period_end) else {
        return Vec::new();
    };
    charges
        .iter()
        .filter(|charge| {
            charge
                .charge_date
                .is_some_and(|date| date >= start && date <= end)
        })
        .map(|charge| ChargeLine {
            label: charge.label().to_string(),
            amount: charge.amount,
        })
        .collect()
}

fn payment_context(
    lease: &Lease,
    payment: &RentPayment,
    today: NaiveDate,
    charges: Vec<ChargeLine>,
) -> NotificationContext {
    NotificationContext {
        organization_id: payment
            .organization_id
            .clone()
            .or_else(|| lease.organization_id.clone()),
        lease_id: lease.id.clone(),
        rent_payment_id: Some(payment.id.clone()),
        property_id: lease.property_id.clone(),
        unit_id: lease.unit_id.clone(),
        tenant_name: lease.tenant_name().to_string(),
        amount: payment.outstanding(),
        late_fee: payment.late_fee(),
        currency: lease.currency.clone(),
        due_date: payment.due_date,
        ends_on: lease.ends_on,
        days_late: payment
            .due_date
            .map(|due_date| days_between(due_date, today))
            .filter(|days| *days > 0),
        days_remaining: None,
        charges,
    }
}

/// Send today's rent notices for one (already evaluated and persisted) payment.
pub async fn dispatch_rent_reminders<S, G>(
    store: &S,
    gateway: &G,
    lease: &Lease,
    payment: &RentPayment,
    today: NaiveDate,
    escalation_days: i64,
) -> DispatchOutcome
where
    S: LedgerStore,
    G: NotificationGateway,
{
    let mut outcome = DispatchOutcome::default();
    let due = reminders_due(lease, payment, today, escalation_days);
    let Some(due_date) = payment.due_date else {
        return outcome;
    };
    if due.is_empty() {
        return outcome;
    }

    let charges = match store.list_lease_charges(&lease.id).await {
        Ok(charges) => charges_in_period(payment, &charges),
        Err(error) => {
            warn!(lease_id = %lease.id, payment_id = %payment.id, %error, "Failed to load lease charges");
            Vec::new()
        }
    };
    let context = payment_context(lease, payment, today, charges);

    for (kind, audience) in due {
        let recipients = match audience {
            Audience::Tenant => tenant_recipients(lease),
            Audience::Managers => manager_recipients(store, lease).await,
        };
        outcome += deliver_once(
            store,
            gateway,
            &payment.id,
            kind,
            due_date,
            &recipients,
            &context,
        )
        .await;
    }

    outcome
}
