//! Filesystems
//!
//! The VFS indirection layer plus the SimpleFS on-disk format. The syscall
//! gate only ever calls `vfs::{open, close, read, write}`; those dispatch
//! through each node's operation record.

pub mod simplefs;
pub mod vfs;
