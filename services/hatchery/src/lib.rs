//! Hatchery engine.
//!
//! Turns pending CI jobs into single-use workers on one backend. The
//! backend is reached through a [`hatchery_sdk::SpawnDriver`], the job
//! server through a [`hatchery_sdk::JobServer`]; everything in between
//! lives here:
//!
//! - [`matcher`]: which worker models can run a job
//! - [`pool`]: reconciled view of the workers
//! - [`capacity`]: admission control and shared counters
//! - [`starter`]: bounded pool of spawn workers
//! - [`dispatch`]: job intake
//! - [`register`]: worker model registration
//! - [`heartbeat`]: hatchery registration upkeep
//! - [`reaper`]: disabled worker cleanup
//! - [`token`]: signed worker credentials
//! - [`engine`]: wiring of all the above

pub mod capacity;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod heartbeat;
pub mod identity;
pub mod matcher;
pub mod pool;
pub mod process;
pub mod queue;
pub mod reaper;
pub mod register;
pub mod starter;
pub mod token;

pub use config::Config;
pub use engine::{Engine, RunningEngine};
