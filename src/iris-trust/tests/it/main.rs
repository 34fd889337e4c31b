//! Consolidated integration tests for iris-trust.
//!
//! One test binary keeps proptest suites and the mock servers from
//! contending across many parallel test processes.
//! See: https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod common;

mod auth;
mod channel;
mod properties;
mod session;
mod updater;
mod wire;
