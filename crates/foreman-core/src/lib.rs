//! Orchestration core for a distributed CI master.
//!
//! Each module owns exactly one subsystem, and the only path between
//! subsystems is [`datastore::DataStore`]: a mutation lands there, an
//! event comes out of [`eventbus::EventBus`], and whoever cares
//! subscribes rather than reaching into another module's state
//! directly. [`botmaster::BotMaster`] is the one type that is allowed
//! to know about every module at once -- it owns construction and
//! wires the distributor's output into spawned [`buildrunner::run_build`]
//! tasks.
//!
//! Start reading at [`botmaster`] for the top-level shape, then
//! [`buildrunner`] for the state machine that does the actual work.

pub mod botmaster;
pub mod buildrunner;
pub mod clock;
pub mod datastore;
pub mod distributor;
pub mod error;
pub mod eventbus;
pub mod jobdir;
pub mod lock;
pub mod logpipeline;
pub mod render;
pub mod scheduler;
pub mod step;
pub mod transport;
pub mod tryjob;
pub mod tryjob_intake;
pub mod worker;

pub use clock::{Clock, SharedClock, SystemClock};
pub use datastore::DataStore;
pub use eventbus::EventBus;
pub use lock::LockArbiter;
pub use logpipeline::{CodecRegistry, LogPipeline};
pub use tryjob_intake::TryJobIntake;
pub use worker::WorkerRegistry;
