//! Process supervision for external protocol daemons
//!
//! [`Supervisor`] is the generic lifecycle controller: process-group spawn,
//! graceful stop, exponential restart backoff with a stable-uptime reset,
//! and a three-strike health watchdog. [`KnxdController`] layers the
//! KNX-specific knowledge on top: argv construction from typed config,
//! layered health probes, and USB recovery.

pub mod knxd;
pub mod process;
pub mod usb;

pub use knxd::{HealthError, HealthLayer, KnxdController};
pub use process::{
    ProcessError, Supervisor, SupervisorConfig, SupervisorStats, SupervisorStatus,
};
