//! Extension points for embedding the provider layer in a larger application
//!
//! By default every request-log record is dropped after it has been traced. Implement
//! [`RequestLogStore`] to persist records (for example into the application's database).

mod request_log_store;

pub use request_log_store::{NoOpRequestLogStore, RequestLogStore, StoreError};
