//! Data models for the Logsieve query pipeline.
//!
//! This module contains the typed field representation and the result row
//! structure shared by every provider and pipeline stage.

pub mod field;
pub mod record;

pub use field::{CoercionError, Field, HashableField};
pub use record::{Record, RAW_COLUMN, SORT_COLUMN, TIME_COLUMN};
