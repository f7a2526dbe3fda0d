use chrono::NaiveDate;

use crate::{
    clock::days_between,
    repository::ledger_store::LedgerStore,
    schemas::Lease,
    services::{
        dispatch::{deliver_once, manager_recipients, tenant_recipients, DispatchOutcome},
        notifications::{NotificationContext, NotificationGateway, NotificationKind},
    },
};

/// Days before `ends_on` at which tenant and managers are told.
pub const EXPIRY_HORIZONS: [i64; 3] = [30, 14, 7];

/// The horizon hit exactly today, if any.
pub fn expiry_horizon(lease: &Lease, today: NaiveDate) -> Option<i64> {
    if !lease.is_active() {
        return None;
    }
    let days_left = days_between(today, lease.ends_on?);
    EXPIRY_HORIZONS.contains(&days_left).then_some(days_left)
}

pub async fn watch_lease_expiry<S, G>(
    store: &S,
    gateway: &G,
    lease: &Lease,
    today: NaiveDate,
) -> DispatchOutcome
where
    S: LedgerStore,
    G: NotificationGateway,
{
    let (Some(days), Some(ends_on)) = (expiry_horizon(lease, today), lease.ends_on) else {
        return DispatchOutcome::default();
    };

    let mut recipients = tenant_recipients(lease);
    recipients.extend(manager_recipients(store, lease).await);

    let context = NotificationContext {
        organization_id: lease.organization_id.clone(),
        lease_id: lease.id.clone(),
        property_id: lease.property_id.clone(),
        unit_id: lease.unit_id.clone(),
        tenant_name: lease.tenant_name().to_string(),
        amount: lease.monthly_rent,
        currency: lease.currency.clone(),
        ends_on: Some(ends_on),
        days_remaining: Some(days),
        ..NotificationContext::default()
    };

    deliver_once(
        store,
        gateway,
        &lease.id,
        NotificationKind::LeaseExpiry { days },
        ends_on,
        &recipients,
        &context,
    )
    .await
}
