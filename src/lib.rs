// Library crate for libcloudfs: bridges POSIX-style file semantics onto an
// S3-compatible object store. The storage module is the public surface;
// cadapter holds the backend seam and blocks the write-coalescing model.

pub mod blocks;
pub mod cadapter;
pub mod config;
pub mod error;
pub mod storage;

pub use cadapter::client::ObjectBackend;
pub use config::CloudConfig;
pub use error::{Result, StorageError};
pub use storage::{CloudStorage, FileHandle};
