//! Content-addressed incremental build caches (4.B, 4.C): a file fingerprint
//! cache and a command result cache, sharing one record-framing and
//! lock-striping mechanism.

pub mod command_db;
pub mod file_db;
pub mod lockfile;
pub mod record;
pub mod sharded;

pub use command_db::CommandCache;
pub use file_db::FileCache;
