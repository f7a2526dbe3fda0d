pub mod ledger_store;
#[cfg(test)]
pub mod memory;
pub mod table_service;
