//! Core of a vhost-user block device backend: guest memory translation, the
//! split virtqueue engine, virtio-blk request parsing, the vhost-user
//! control plane, and the single-threaded reactor tying them together.

pub mod blk;
pub mod device;
pub mod memory;
pub mod protocol;
pub mod reactor;
pub mod vhost_dev;
pub mod virtqueue;
pub mod vring;

pub use device::{BlockBackend, BlockDevice};
pub use vhost_dev::VhostDev;
