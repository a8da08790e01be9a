//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the crate:
//! - Generational handles and the handle pool
//! - Alignment arithmetic for memory sub-allocation
//! - Logging utilities

pub mod collections;
pub mod memory;
pub mod logging;
