//! Test doubles for hatchery engines.
//!
//! - [`FakeJobServer`]: in-memory job server recording every call
//! - [`FakeDriver`]: spawn driver keeping started instances in memory
//! - Fixture builders for models and jobs

mod driver;
mod fixtures;
mod job_server;

pub use driver::FakeDriver;
pub use fixtures::{job, model};
pub use job_server::{Call, FakeJobServer};
