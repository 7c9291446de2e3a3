//! # hatchery-sdk
//!
//! Data model and collaborator interfaces shared by hatchery engines,
//! job server clients and spawn drivers.
//!
//! ## Contents
//!
//! - Typed numeric IDs (`JobId`, `ModelId`, `WorkerId`, `GroupId`, `HatcheryId`)
//! - Jobs, requirements and worker models as served by the job server
//! - Worker statuses and reconciled pool records
//! - Spawn arguments and spawn messages
//! - Worker naming conventions (`names`)
//! - The `JobServer` and `SpawnDriver` traits

mod error;
mod macros;
pub mod names;
mod traits;
mod types;

pub use error::{DriverError, JobServerError};
pub use traits::{JobServer, SpawnDriver};
pub use types::*;
