//! Concrete hardware implementations behind the [`platform`](crate::platform) traits.

pub mod affinity;
pub mod msr;
pub mod timing;
pub mod wait;

pub use affinity::LinuxTopology;
pub use msr::DevMsr;
pub use wait::{PollWait, Umwait};
