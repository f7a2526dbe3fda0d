use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDate};
use chrono_tz::Tz;
use tokio::{
    sync::{watch, Semaphore},
    task::{JoinHandle, JoinSet},
    time::sleep,
};
use tracing::{error, info, warn};

use crate::{
    clock::{start_of_day, Clock},
    config::AppConfig,
    error::AppResult,
    repository::ledger_store::LedgerStore,
    schemas::Lease,
    services::{
        dispatch::DispatchOutcome, lease_expiry::watch_lease_expiry,
        notifications::NotificationGateway, payment_status::evaluate_payment,
        rent_reminders::dispatch_rent_reminders,
    },
};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub timezone: Tz,
    pub daily_run_hour: u32,
    pub poll_interval: Duration,
    pub max_concurrency: usize,
    pub shutdown_grace: Duration,
    pub late_escalation_days: i64,
}

impl SchedulerOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            timezone: config.scheduler_timezone,
            daily_run_hour: config.scheduler_daily_run_hour,
            poll_interval: config.poll_interval(),
            max_concurrency: config.scheduler_max_concurrency,
            shutdown_grace: config.shutdown_grace(),
            late_escalation_days: config.late_escalation_days,
        }
    }
}

/// Counts for one pass over the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub leases: u32,
    pub payments_evaluated: u32,
    pub payments_updated: u32,
    pub payments_changed_externally: u32,
    pub fees_assessed: u32,
    pub notifications_sent: u32,
    pub notifications_deduplicated: u32,
    pub notifications_skipped: u32,
    pub data_errors: u32,
    pub errors: u32,
}

impl TickSummary {
    fn record(&mut self, outcome: DispatchOutcome) {
        self.notifications_sent += outcome.sent;
        self.notifications_deduplicated += outcome.already_sent;
        self.notifications_skipped += outcome.skipped;
        self.errors += outcome.failed;
    }
}

impl AddAssign for TickSummary {
    fn add_assign(&mut self, other: Self) {
        self.leases += other.leases;
        self.payments_evaluated += other.payments_evaluated;
        self.payments_updated += other.payments_updated;
        self.payments_changed_externally += other.payments_changed_externally;
        self.fees_assessed += other.fees_assessed;
        self.notifications_sent += other.notifications_sent;
        self.notifications_deduplicated += other.notifications_deduplicated;
        self.notifications_skipped += other.notifications_skipped;
        self.data_errors += other.data_errors;
        self.errors += other.errors;
    }
}

/// Evaluates every active lease once a day, or once on demand.
///
/// Each instance owns its collaborators; nothing is global, so tests can
/// build as many as they like.
pub struct LedgerScheduler<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
    clock: Arc<dyn Clock>,
    options: SchedulerOptions,
}

/// Handle to a scheduler running on its own task.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop scheduling ticks and wait for the loop to exit. An in-flight tick
    /// gets the configured grace period before it is cancelled.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            error!(%error, "Scheduler task ended abnormally");
        }
    }
}

impl<S, G> LedgerScheduler<S, G>
where
    S: LedgerStore,
    G: NotificationGateway,
{
    pub fn new(
        store: Arc<S>,
        gateway: Arc<G>,
        clock: Arc<dyn Clock>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            options,
        }
    }

    pub fn start(self) -> SchedulerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(receiver).await });
        SchedulerHandle { shutdown, task }
    }

    /// Continuous mode: one tick per calendar day, at or after the run hour.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            timezone = %self.options.timezone,
            run_hour = self.options.daily_run_hour,
            "Rent ledger scheduler started"
        );
        let mut last_daily_run: Option<NaiveDate> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = self.clock.now();
            let today = self.clock.today(self.options.timezone);
            let run_at = start_of_day(now, self.options.timezone)
                + ChronoDuration::hours(i64::from(self.options.daily_run_hour));

            if last_daily_run != Some(today) && now >= run_at {
                last_daily_run = Some(today);
                info!(%today, "Scheduler: running daily rent ledger tick");

                let tick = self.run_tick();
                tokio::pin!(tick);
                tokio::select! {
                    result = &mut tick => log_tick(&result),
                    _ = shutdown.changed() => {
                        info!("Shutdown requested, letting in-flight tick finish");
                        match tokio::time::timeout(self.options.shutdown_grace, &mut tick).await {
                            Ok(result) => log_tick(&result),
                            Err(_) => warn!(
                                grace_seconds = self.options.shutdown_grace.as_secs(),
                                "In-flight tick cancelled after shutdown grace period"
                            ),
                        }
                        break;
                    }
                }
            }

            tokio::select! {
                _ = sleep(self.options.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Rent ledger scheduler stopped");
    }

    /// One pass over every active lease. Fails only when the active leases
    /// cannot be listed; everything after that is contained per entity.
    pub async fn run_tick(&self) -> AppResult<TickSummary> {
        let today = self.clock.today(self.options.timezone);
        let leases = self.store.list_active_leases().await?;

        let mut summary = TickSummary::default();
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for row in leases {
            let lease = match row {
                Ok(lease) => lease,
                Err(error) => {
                    warn!(%error, "Skipping malformed lease");
                    summary.data_errors += 1;
                    continue;
                }
            };
            if !lease.is_active() {
                continue;
            }
            summary.leases += 1;

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let store = Arc::clone(&self.store);
            let gateway = Arc::clone(&self.gateway);
            let escalation_days = self.options.late_escalation_days;
            tasks.spawn(async move {
                let _permit = permit;
                process_lease(&*store, &*gateway, &lease, today, escalation_days).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(lease_summary) => summary += lease_summary,
                Err(error) => {
                    warn!(%error, "Lease task failed");
                    summary.errors += 1;
                }
            }
        }

        Ok(summary)
    }
}

pub fn log_tick(result: &AppResult<TickSummary>) {
    match result {
        Ok(summary) => info!(
            leases = summary.leases,
            evaluated = summary.payments_evaluated,
            updated = summary.payments_updated,
            changed_externally = summary.payments_changed_externally,
            fees = summary.fees_assessed,
            sent = summary.notifications_sent,
            deduplicated = summary.notifications_deduplicated,
            skipped = summary.notifications_skipped,
            data_errors = summary.data_errors,
            errors = summary.errors,
            "Scheduler: rent ledger tick completed"
        ),
        Err(error) => error!(
            %error,
            transient = error.is_transient(),
            "Scheduler: rent ledger tick aborted"
        ),
    }
}

/// Evaluate, persist and notify for one lease. Never fails; problems are
/// logged and counted.
async fn process_lease<S, G>(
    store: &S,
    gateway: &G,
    lease: &Lease,
    today: NaiveDate,
    escalation_days: i64,
) -> TickSummary
where
    S: LedgerStore,
    G: NotificationGateway,
{
    let mut summary = TickSummary::default();

    match store.list_open_rent_payments(&lease.id).await {
        Ok(payments) => {
            for row in payments {
                let mut payment = match row {
                    Ok(payment) => payment,
                    Err(error) => {
                        warn!(lease_id = %lease.id, %error, "Skipping malformed rent payment");
                        summary.data_errors += 1;
                        continue;
                    }
                };
                summary.payments_evaluated += 1;

                let evaluation = match evaluate_payment(lease, &payment, today) {
                    Ok(evaluation) => evaluation,
                    Err(error) => {
                        warn!(lease_id = %lease.id, payment_id = %payment.id, %error, "Skipping rent payment");
                        summary.data_errors += 1;
                        continue;
                    }
                };

                if evaluation.is_changed() {
                    let written = store
                        .update_payment_status(
                            &payment.id,
                            payment.status,
                            payment.late_fee,
                            evaluation.status,
                            evaluation.late_fee,
                        )
                        .await;
                    match written {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(
                                lease_id = %lease.id,
                                payment_id = %payment.id,
                                "Rent payment changed since it was read, skipped until next tick"
                            );
                            summary.payments_changed_externally += 1;
                            continue;
                        }
                        Err(error) => {
                            warn!(
                                lease_id = %lease.id,
                                payment_id = %payment.id,
                                %error,
                                "Failed to persist rent payment status"
                            );
                            summary.errors += 1;
                            continue;
                        }
                    }
                    info!(
                        payment_id = %payment.id,
                        from = evaluation.previous_status.as_str(),
                        to = evaluation.status.as_str(),
                        late_fee = evaluation.late_fee,
                        "Rent payment updated"
                    );
                    summary.payments_updated += 1;
                    if evaluation.fee_assessed {
                        summary.fees_assessed += 1;
                    }
                }
                evaluation.apply_to(&mut payment);

                summary.record(
                    dispatch_rent_reminders(store, gateway, lease, &payment, today, escalation_days)
                        .await,
                );
            }
        }
        Err(error) => {
            warn!(lease_id = %lease.id, %error, "Failed to list rent payments");
            summary.errors += 1;
        }
    }

    summary.record(watch_lease_expiry(store, gateway, lease, today).await);
    summary
}
