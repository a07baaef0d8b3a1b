//! vgx-instance — admin operations on running VGX nodes.
//!
//! An [`InstanceHandle`] pairs a validated [`vgx_core::Instance`] with a
//! [`vgx_remote::RemoteNodeClient`] bound to its admin port, plus the
//! handles of its transaction subscribers. A [`Cluster`] builds the
//! handles for a whole descriptor and fans operations out over a
//! selection of instances.

pub mod cluster;
pub mod fanout;
pub mod handle;
pub mod nodestat;

pub use cluster::Cluster;
pub use fanout::{FanOutResult, fan_out};
pub use handle::InstanceHandle;
pub use nodestat::{Nodestat, truthy};
