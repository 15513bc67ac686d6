//! Query execution pipeline.
//!
//! The engine consumes a pre-parsed search AST (the query-language surface
//! grammar lives outside this crate) and post-processes merged provider
//! results in a fixed, documented stage order: streaming merge, optional
//! aggregation/bucketing, optional order-by.
//!
//! # Example
//!
//! ```
//! use shared::query::{CaseSensitivity, Matcher, Search};
//!
//! let ast = Search::and(Search::literal(["error"]), Search::literal(["db"]));
//! let matcher = Matcher::new(&ast, CaseSensitivity::Sensitive);
//! assert!(matcher.matches("db error: connection refused"));
//! ```

pub mod aggregate;
pub mod merge;
pub mod order;
pub mod search;

pub use aggregate::{aggregate, bucket, AggregateError, AggregateSpec, AggregationResult};
pub use merge::merge_batches;
pub use order::{order_by, Direction, OrderRule};
pub use search::{CaseSensitivity, Matcher, Search};
