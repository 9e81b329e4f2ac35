#![forbid(unsafe_code)]

mod batch;
mod engine;
mod iter;
pub mod keys;
mod log;
mod sweeper;
mod ttl;

pub use batch::{Op, WriteBatch};
pub use engine::{Engine, EngineOptions, EngineStats, LOG_FILE, ReadView};
pub use iter::RangeIter;
pub use log::FsyncPolicy;
pub use sweeper::{Sweeper, SweeperHandle, SweeperStatus};
pub use ttl::{MAX_TTL, SweepStats, TtlStore, now_millis, parse_ttl};
