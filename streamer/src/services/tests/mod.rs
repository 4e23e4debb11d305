//! Tests for streamer services
//!
//! The connection manager is driven through an in-memory collector that
//! follows a script (reject, drop the link, stay silent, cancel...).

pub mod scripted;

pub use crate::traits::*;
