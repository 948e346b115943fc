pub mod admission;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod storage;

pub use admission::{AdmissionError, FetchAdmission, FetchPlan};
pub use error::{IndexError, Result};
pub use storage::{AdmissionStore, InMemoryStore, SqliteStore};
