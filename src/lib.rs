//! Tradeloom Backend Library
//!
//! Exposes core modules for use by binaries and tests.

pub mod marketdata;
pub mod models;
pub mod spooler;
