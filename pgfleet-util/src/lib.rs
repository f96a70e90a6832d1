//! Small shared utilities for pgfleet services.

pub mod shutdown;
