//! Device drivers
//!
//! The block layer is the only driver surface the core depends on; the ATA
//! PIO driver registers the disks it finds behind it.

pub mod block;

#[cfg(target_os = "none")]
pub mod ata;
