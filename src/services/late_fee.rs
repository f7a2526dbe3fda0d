use crate::schemas::{Lease, RentPayment};

/// Flat late fee configured on the lease. No proration by days late, no cap.
///
/// Callers assess it once per breach; this function never looks at the fee
/// already on the payment.
pub fn compute_late_fee(lease: &Lease, _payment: &RentPayment) -> i64 {
    lease.late_fee_amount.unwrap_or(0).max(0)
}
