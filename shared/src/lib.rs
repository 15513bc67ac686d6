//! Logsieve Shared Library
//!
//! This crate contains the query execution core shared by the logsieve
//! engine and CLI.
//!
//! # Modules
//!
//! - [`models`] - Typed field and result row models
//! - [`query`] - Search predicates, merging, aggregation, and ordering
//! - [`providers`] - Log source adapters behind the [`providers::QueryProvider`] trait
//! - [`jobs`] - Job control, wire protocol, transport, and the query engine
//!
//! # Example
//!
//! ```
//! use shared::models::{Field, Record};
//! use shared::query::{CaseSensitivity, Matcher, Search};
//!
//! let record = Record::new(chrono::Utc::now(), "connection refused by upstream")
//!     .with_column("level", Field::Str("error".to_string()));
//!
//! let search = Search::and(
//!     Search::literal(["connection"]),
//!     Search::literal(["refused"]),
//! );
//! let matcher = Matcher::new(&search, CaseSensitivity::Insensitive);
//!
//! assert!(matcher.matches(&record.message));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod jobs;
pub mod models;
pub mod providers;
pub mod query;

/// Re-export common dependencies for convenience.
pub use chrono;
pub use serde;
pub use serde_json;
pub use validator;
