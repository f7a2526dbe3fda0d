pub mod dispatch;
pub mod late_fee;
pub mod lease_expiry;
pub mod notifications;
pub mod payment_status;
pub mod rent_reminders;
pub mod scheduler;
