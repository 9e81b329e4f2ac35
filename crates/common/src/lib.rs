#![forbid(unsafe_code)]

mod error;

pub use error::*;

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_DATA_DIR: &str = "./db";
pub const DEFAULT_STATIC_DIR: &str = "build";
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;
pub const MAX_UPLOAD_SIZE: usize = 32 * 1024 * 1024; // 32 MB
pub const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024; // 256 MB
/// Ciclos de sweep consecutivos com falha antes de desistir.
pub const MAX_CONSECUTIVE_SWEEP_FAILURES: u32 = 5;
