use std::ops::AddAssign;

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::{
    repository::ledger_store::LedgerStore,
    schemas::{Lease, Recipient},
    services::notifications::{NotificationContext, NotificationGateway, NotificationKind},
};

/// What happened to the notifications requested for one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub sent: u32,
    pub already_sent: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl AddAssign for DispatchOutcome {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.already_sent += other.already_sent;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Tenant contact, when the lease carries a phone or email.
pub fn tenant_recipients(lease: &Lease) -> Vec<Recipient> {
    let tenant = lease.tenant_recipient();
    if tenant.is_reachable() {
        vec![tenant]
    } else {
        Vec::new()
    }
}

/// Manager contacts for the lease's organization. Lookup failures are logged
/// and yield no recipients.
pub async fn manager_recipients<S: LedgerStore>(store: &S, lease: &Lease) -> Vec<Recipient> {
    let Some(org_id) = lease.organization_id.as_deref() else {
        return Vec::new();
    };
    match store.list_manager_contacts(org_id).await {
        Ok(contacts) => contacts,
        Err(error) => {
            warn!(lease_id = %lease.id, org_id, %error, "Failed to resolve manager contacts");
            Vec::new()
        }
    }
}

/// Marker key for one recipient of `kind`. The address keeps managers who
/// share a name apart.
pub fn marker_kind(kind: NotificationKind, recipient: &Recipient) -> String {
    let address = recipient
        .phone_e164
        .as_deref()
        .or(recipient.email.as_deref())
        .unwrap_or(recipient.name.as_str());
    format!("{}:{address}", kind.key())
}

/// Send `kind` to each recipient at most once per `(entity, kind, recipient,
/// marker_day)`.
///
/// Each recipient's marker is taken before its send, so concurrent workers
/// racing on the same key cannot both deliver. A failed send releases that
/// recipient's marker and the next tick retries only them.
pub async fn deliver_once<S, G>(
    store: &S,
    gateway: &G,
    entity_id: &str,
    kind: NotificationKind,
    marker_day: NaiveDate,
    recipients: &[Recipient],
    context: &NotificationContext,
) -> DispatchOutcome
where
    S: LedgerStore,
    G: NotificationGateway,
{
    let mut outcome = DispatchOutcome::default();

    if recipients.is_empty() {
        warn!(entity_id, kind = %kind.key(), "No reachable recipient, notification skipped");
        outcome.skipped += 1;
        return outcome;
    }

    for recipient in recipients {
        let marker = marker_kind(kind, recipient);
        match store.mark_notified(entity_id, &marker, marker_day).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(entity_id, kind = %marker, "Already notified");
                outcome.already_sent += 1;
                continue;
            }
            Err(error) => {
                warn!(entity_id, kind = %marker, %error, "Failed to record notification marker");
                outcome.failed += 1;
                continue;
            }
        }

        match gateway.send_reminder(recipient, kind, context).await {
            Ok(receipt) => {
                debug!(
                    entity_id,
                    kind = %marker,
                    channel = receipt.channel.as_str(),
                    "Notification sent"
                );
                outcome.sent += 1;
            }
            Err(error) => {
                warn!(
                    entity_id,
                    kind = %marker,
                    recipient = %recipient.name,
                    %error,
                    "Notification delivery failed"
                );
                outcome.failed += 1;
                if let Err(error) = store.clear_notified(entity_id, &marker, marker_day).await {
                    warn!(entity_id, kind = %marker, %error, "Failed to release notification marker");
                }
            }
        }
    }

    outcome
}
