//! Integration test suite for the recalculation engine.
//!
//! Tests are organized by area:
//! 1. Link cascades across two tables
//! 2. Bulk recompute and reset
//! 3. Concurrent writers

pub mod bulk_tests;
pub mod cascade_tests;
pub mod concurrency_tests;
pub mod helpers;
