//! Utility functions for the demos
//!
//! Host-side setup of the TUN interface the stack talks through.

pub mod network;
