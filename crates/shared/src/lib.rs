#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Storefront Shared Types and Utilities
//!
//! Vocabulary types and database helpers shared by the entitlement engine
//! and the worker that drives it.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
