//! Workspace end-to-end tests for the `covtrace` binary.
//!
//! The fake toolchain is a set of POSIX shell scripts, so these only run on Unix.

#![cfg(unix)]

mod end_to_end;
mod support;
