//! covtrace workspace-level test support.
//!
//! This crate exists solely to host the end-to-end tests in
//! `tests/integration/`, which drive the real `covtrace` binary against a
//! fake toolchain of shell scripts.
//!
//! The actual covtrace functionality is in the workspace member crates:
//! - `covtrace-types`: Shared types and JSON schemas
//! - `covtrace-domain`: Grouping, merge planning, resampling and summary parsing
//! - `covtrace-adapters`: Process runner and corpus enumeration
//! - `covtrace-config`: Config file loading and resolution
//! - `covtrace-app`: Application use cases
//! - `covtrace` (covtrace-cli): CLI interface
