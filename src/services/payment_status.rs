use chrono::{Days, NaiveDate};
use thiserror::Error;

use crate::{
    schemas::{Lease, PaymentStatus, RentPayment},
    services::late_fee::compute_late_fee,
};

/// A payment or lease row that cannot be evaluated. The record is skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerDataError {
    #[error("rent payment {0} has no due date")]
    MissingDueDate(String),
    #[error("rent payment {0} has no amount due")]
    MissingAmountDue(String),
    #[error("lease {0} has no late fee grace period")]
    MissingGraceDays(String),
    #[error("lease {lease_id} has a negative grace period ({days})")]
    NegativeGraceDays { lease_id: String, days: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentEvaluation {
    pub previous_status: PaymentStatus,
    pub previous_late_fee: i64,
    pub status: PaymentStatus,
    pub late_fee: i64,
    pub fee_assessed: bool,
}

impl PaymentEvaluation {
    fn unchanged(payment: &RentPayment) -> Self {
        Self {
            previous_status: payment.status,
            previous_late_fee: payment.late_fee(),
            status: payment.status,
            late_fee: payment.late_fee(),
            fee_assessed: false,
        }
    }

    pub fn is_changed(&self) -> bool {
        self.status != self.previous_status || self.late_fee != self.previous_late_fee
    }

    pub fn apply_to(&self, payment: &mut RentPayment) {
        payment.status = self.status;
        payment.late_fee = Some(self.late_fee);
    }
}

/// First day a payment counts as late.
pub fn grace_deadline(lease: &Lease, payment: &RentPayment) -> Result<NaiveDate, LedgerDataError> {
    let due_date = payment
        .due_date
        .ok_or_else(|| LedgerDataError::MissingDueDate(payment.id.clone()))?;
    let grace_days = lease
        .late_fee_grace_days
        .ok_or_else(|| LedgerDataError::MissingGraceDays(lease.id.clone()))?;
    let grace_days = u64::try_from(grace_days).map_err(|_| LedgerDataError::NegativeGraceDays {
        lease_id: lease.id.clone(),
        days: grace_days,
    })?;
    Ok(due_date
        .checked_add_days(Days::new(grace_days))
        .unwrap_or(NaiveDate::MAX))
}

/// Derive the status and late fee a payment should carry on `today`.
///
/// Pure: nothing is persisted here. `paid` and `waived` records come back
/// unchanged, status never moves backwards along the lifecycle, and a fee is
/// only assessed while the payment has none.
pub fn evaluate_payment(
    lease: &Lease,
    payment: &RentPayment,
    today: NaiveDate,
) -> Result<PaymentEvaluation, LedgerDataError> {
    let mut evaluation = PaymentEvaluation::unchanged(payment);
    if payment.status.is_terminal() {
        return Ok(evaluation);
    }

    let amount_due = payment
        .amount_due
        .ok_or_else(|| LedgerDataError::MissingAmountDue(payment.id.clone()))?
        .max(0);
    let amount_paid = payment.amount_paid();
    let existing_fee = payment.late_fee();

    if amount_paid >= amount_due.saturating_add(existing_fee) {
        evaluation.status = PaymentStatus::Paid;
        return Ok(evaluation);
    }

    let due_date = payment
        .due_date
        .ok_or_else(|| LedgerDataError::MissingDueDate(payment.id.clone()))?;
    let deadline = grace_deadline(lease, payment)?;
    let breached = today >= deadline;

    let candidate = if amount_paid > 0 && amount_paid < amount_due && !breached {
        PaymentStatus::Partial
    } else if today < due_date {
        PaymentStatus::Upcoming
    } else if !breached {
        PaymentStatus::Due
    } else {
        PaymentStatus::Late
    };

    if candidate == PaymentStatus::Late && existing_fee == 0 {
        let fee = compute_late_fee(lease, payment);
        if fee > 0 {
            evaluation.late_fee = fee;
            evaluation.fee_assessed = true;
        }
    }

    evaluation.status = furthest(payment.status, candidate);
    Ok(evaluation)
}

fn furthest(current: PaymentStatus, candidate: PaymentStatus) -> PaymentStatus {
    match (current.lifecycle_rank(), candidate.lifecycle_rank()) {
        (Some(current_rank), Some(candidate_rank)) if candidate_rank < current_rank => current,
        _ => candidate,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Days, NaiveDate};
    use serde_json::json;

    use super::{evaluate_payment, LedgerDataError};
    use crate::schemas::{decode_row, Lease, PaymentStatus, RentPayment};

    fn due() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).expect("valid date")
    }

    fn lease() -> Lease {
        decode_row(
            "leases",
            json!({
                "id": "lease-1",
                "lease_status": "active",
                "monthly_rent": 150000,
                "late_fee_amount": 5000,
                "late_fee_grace_days": 5
            }),
        )
        .expect("lease decodes")
    }

    fn payment(status: &str, amount_paid: i64, late_fee: i64) -> RentPayment {
        decode_row(
            "rent_payments",
            json!({
                "id": "pay-1",
                "lease_id": "lease-1",
                "due_date": due(),
                "amount_due": 150000,
                "amount_paid": amount_paid,
                "late_fee": late_fee,
                "status": status
            }),
        )
        .expect("payment decodes")
    }

    fn day(offset: i64) -> NaiveDate {
        if offset >= 0 {
            due() + Days::new(offset.unsigned_abs())
        } else {
            due() - Days::new(offset.unsigned_abs())
        }
    }

    #[test]
    fn follows_the_timeline_for_unpaid_rent() {
        let lease = lease();
        let cases = [
            (-3, PaymentStatus::Upcoming),
            (0, PaymentStatus::Due),
            (4, PaymentStatus::Due),
            (5, PaymentStatus::Late),
        ];
        for (offset, expected) in cases {
            let evaluation =
                evaluate_payment(&lease, &payment("upcoming", 0, 0), day(offset)).expect("ok");
            assert_eq!(evaluation.status, expected, "offset {offset}");
        }
    }

    #[test]
    fn due_today_has_no_fee() {
        let evaluation = evaluate_payment(&lease(), &payment("upcoming", 0, 0), due()).expect("ok");
        assert_eq!(evaluation.status, PaymentStatus::Due);
        assert_eq!(evaluation.late_fee, 0);
        assert!(!evaluation.fee_assessed);
        assert!(evaluation.is_changed());
    }

    #[test]
    fn late_fee_is_assessed_once() {
        let lease = lease();
        let mut record = payment("due", 0, 0);

        let first = evaluate_payment(&lease, &record, day(6)).expect("ok");
        assert_eq!(first.status, PaymentStatus::Late);
        assert_eq!(first.late_fee, 5000);
        assert!(first.fee_assessed);
        first.apply_to(&mut record);

        for offset in 6..40 {
            let again = evaluate_payment(&lease, &record, day(offset)).expect("ok");
            assert_eq!(again.status, PaymentStatus::Late);
            assert_eq!(again.late_fee, 5000);
            assert!(!again.fee_assessed);
            assert!(!again.is_changed());
            again.apply_to(&mut record);
        }
    }

    #[test]
    fn partial_payment_before_breach_is_partial() {
        let evaluation =
            evaluate_payment(&lease(), &payment("due", 50000, 0), day(1)).expect("ok");
        assert_eq!(evaluation.status, PaymentStatus::Partial);
        assert_eq!(evaluation.late_fee, 0);
    }

    #[test]
    fn partial_payment_does_not_exempt_from_fee() {
        let evaluation =
            evaluate_payment(&lease(), &payment("partial", 50000, 0), day(5)).expect("ok");
        assert_eq!(evaluation.status, PaymentStatus::Late);
        assert_eq!(evaluation.late_fee, 5000);
    }

    #[test]
    fn paid_requires_rent_plus_fee() {
        let lease = lease();
        let rent_only = evaluate_payment(&lease, &payment("late", 150000, 5000), day(8))
            .expect("ok");
        assert_eq!(rent_only.status, PaymentStatus::Late);

        let settled = evaluate_payment(&lease, &payment("late", 155000, 5000), day(8))
            .expect("ok");
        assert_eq!(settled.status, PaymentStatus::Paid);
        assert_eq!(settled.late_fee, 5000);

        let early = evaluate_payment(&lease, &payment("upcoming", 150000, 0), day(-2))
            .expect("ok");
        assert_eq!(early.status, PaymentStatus::Paid);
    }

    #[test]
    fn extreme_amounts_do_not_overflow() {
        let mut record = payment("late", 1, 5000);
        record.amount_due = Some(i64::MAX);
        let evaluation = evaluate_payment(&lease(), &record, day(8)).expect("ok");
        assert_eq!(evaluation.status, PaymentStatus::Late);

        record.amount_paid = Some(i64::MAX);
        let settled = evaluate_payment(&lease(), &record, day(8)).expect("ok");
        assert_eq!(settled.status, PaymentStatus::Paid);
    }

    #[test]
    fn terminal_records_are_left_alone() {
        let lease = lease();
        for status in ["waived", "paid"] {
            let record = payment(status, 0, 0);
            let evaluation = evaluate_payment(&lease, &record, day(30)).expect("ok");
            assert_eq!(evaluation.status, record.status);
            assert!(!evaluation.is_changed());
        }
    }

    #[test]
    fn late_payment_that_gets_partially_paid_stays_late() {
        let evaluation =
            evaluate_payment(&lease(), &payment("late", 20000, 5000), day(9)).expect("ok");
        assert_eq!(evaluation.status, PaymentStatus::Late);
        assert_eq!(evaluation.late_fee, 5000);
        assert!(!evaluation.is_changed());
    }

    #[test]
    fn status_never_moves_backwards() {
        let lease = lease();
        let mut record = payment("upcoming", 0, 0);
        let mut last_rank = record.status.lifecycle_rank();
        for offset in -5..20 {
            if offset == 2 {
                record.amount_paid = Some(40000);
            }
            let evaluation = evaluate_payment(&lease, &record, day(offset)).expect("ok");
            evaluation.apply_to(&mut record);
            let rank = record.status.lifecycle_rank();
            assert!(rank >= last_rank, "regressed at offset {offset}");
            last_rank = rank;
        }
        assert_eq!(record.status, PaymentStatus::Late);
    }

    #[test]
    fn missing_fields_are_data_errors() {
        let lease = lease();
        let mut no_due_date = payment("due", 0, 0);
        no_due_date.due_date = None;
        assert_eq!(
            evaluate_payment(&lease, &no_due_date, due()),
            Err(LedgerDataError::MissingDueDate("pay-1".to_string()))
        );

        let mut no_amount = payment("due", 0, 0);
        no_amount.amount_due = None;
        assert_eq!(
            evaluate_payment(&lease, &no_amount, due()),
            Err(LedgerDataError::MissingAmountDue("pay-1".to_string()))
        );

        let mut no_grace = lease.clone();
        no_grace.late_fee_grace_days = None;
        assert_eq!(
            evaluate_payment(&no_grace, &payment("due", 0, 0), due()),
            Err(LedgerDataError::MissingGraceDays("lease-1".to_string()))
        );

        let mut negative = lease;
        negative.late_fee_grace_days = Some(-1);
        assert!(matches!(
            evaluate_payment(&negative, &payment("due", 0, 0), due()),
            Err(LedgerDataError::NegativeGraceDays { days: -1, .. })
        ));
    }
}
