//! Striped RAID file layouts: parallel stripe I/O, lazy group parity, degraded reads and
//! header-driven stripe remapping.
#![allow(clippy::cargo_common_metadata)]

pub mod channel;
pub mod config;
pub mod error;
pub mod header;
pub mod layout;
pub mod map;
pub mod metrics;
pub mod parity;
pub mod pieces;
pub mod tracker;

pub use config::{LayoutConfig, LayoutId, LayoutKind};
pub use error::{LayoutError, Result};
pub use layout::raid::{RaidLayout, StripeHealth};
pub use layout::{Layout, LayoutStat, open_layout};
