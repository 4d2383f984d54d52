//! Stack composition layer
//!
//! This module ties the protocol layers to a device:
//! - `Inet<V>`: the capability interface every stack exposes
//! - `Inet4`: the IPv4 stack owning one device
//! - Configuration state and observers
//! - Devices: in-memory loopback and Linux TUN
//! - The registry holding one stack per device

pub mod config;
pub mod device;
pub mod inet;
pub mod registry;
pub mod stack;

// Re-export commonly used items
pub use config::{ConfigHandle, ConfigHandler, Ipv4Config, StackOptions};
pub use device::{Device, LoopbackDevice, TunDevice};
pub use inet::{Inet, IpVersion, V4};
pub use registry::StackRegistry;
pub use stack::Inet4;
