//! Block transport: NBD client plumbing and the VHD container stream
//! built on top of it.

pub mod nbd;
pub mod vhd;

pub use nbd::{raw_stream, MultiNbdClient, NbdChannel, NbdDialer, READ_CHUNK};
pub use vhd::{vhd_stream, DiskIdentity, ProgressFn};
