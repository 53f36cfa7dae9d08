// src/errors.rs

//! Crate-wide error aliases.
//!
//! A thin wrapper around `anyhow`; configuration and filesystem problems are
//! reported through these, while job-level failures travel as data in status
//! files and never abort the dispatcher.

pub use anyhow::{Error, Result};
