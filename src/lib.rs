pub mod config;
pub mod error;
pub mod node;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{JobError, Result};
