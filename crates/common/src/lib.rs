//! Common building blocks for the portico gateway.
//!
//! - [`KeyedStore`]: reader-writer guarded map shared by the certificate
//!   table and the challenge token map
//! - [`persist`]: write-temp-then-rename JSON persistence
//! - [`metrics`]: the injected metrics sink and its Prometheus backend

pub mod errors;
pub mod keyed_store;
pub mod metrics;
pub mod persist;

pub use errors::PersistError;
pub use keyed_store::KeyedStore;
pub use metrics::{
    MetricsSink, PrometheusSink, CACHE_HITS_TOTAL, CACHE_REQUESTS_TOTAL,
    HTTP_REQUESTS_TOTAL, HTTP_RESPONSE_TIME_SECONDS,
};
