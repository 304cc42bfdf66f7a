//! Integration test suite for flowsched.
//!
//! These tests exercise jobs end to end: flow block resolution, lazy
//! expansion of branches, loops and replicates, error policies, and the
//! async scheduler. They verify that all components work together.
//!
//! # Test Categories
//!
//! - `control_flow`: Branch, loop and replicate semantics
//! - `scheduling`: Readiness, concurrency, cancellation and status queries
//! - `error_policies`: Failure handling, expansion limits and validation
//! - `descriptors`: Bundled demo jobs run with the local executor
//!
//! # CI Compatibility
//!
//! Executors are mocks or the in-process rhai executor; nothing leaves the
//! test process.

mod fixtures;

mod control_flow;
mod descriptors;
mod scheduling;
