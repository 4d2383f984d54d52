//! Small data structures and helpers shared by the stack

pub mod bitmap;
pub mod cidr;

pub use bitmap::{BitmapView, FixedBitmap};
pub use cidr::parse_ip_cidr;
