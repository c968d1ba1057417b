//! The outbound delivery engine: picks due messages from the queue,
//! chooses a sending identity, applies rate and connection limits,
//! speaks SMTP to the destination MX and schedules retries.
pub mod config;
pub mod delivery;
pub mod egress_source;
pub mod engine;
pub mod inject;
pub mod logging;
pub mod message;
pub mod pool;
pub mod queue;
pub mod retry;

#[cfg(test)]
mod testing;
