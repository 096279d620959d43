//! Dependency-ordered loading of tabular datasets into PostgreSQL.
//!
//! The pieces, leaves first:
//! - [`splitter`] turns SQL script text into statements
//! - [`plan`] orders table writes by declared dependencies
//! - [`runner`] executes script files with abort or continue semantics
//! - [`loader`] resets schemas, runs DDL, loads datasets and resyncs sequences
//! - [`db`] is the database seam those components talk to

pub mod config;
pub mod dataset;
pub mod db;
pub mod loader;
pub mod logging;
pub mod plan;
pub mod progress;
pub mod runner;
pub mod splitter;
pub mod transform;
