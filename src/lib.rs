//! Offline caching engine for the PlantPerfectly gardening app.
//!
//! An [`worker::OfflineWorker`] intercepts requests for one origin, serving
//! static assets cache-first and API data network-first, and queues form
//! submissions made while offline for replay by background sync. The
//! [`cache::ExpiringCache`] is a standalone TTL cache for JSON values.

pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod http;
pub mod logging;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod testing;
