//! Filesystem abstraction for Firewall Warden.
//!
//! This crate provides:
//! - `Filesystem` trait for atomic replace, append-only writes and offset reads
//! - `RealFilesystem` and an in-memory `MockFilesystem`
//! - `DeadlineFilesystem`, which bounds every write/read with a timeout

pub mod deadline;
pub mod filesystem;

pub use deadline::DeadlineFilesystem;
pub use filesystem::{Filesystem, FsError, MockFilesystem, RealFilesystem};
