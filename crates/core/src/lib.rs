//! `courier-core`: transport-agnostic building blocks.
//!
//! This crate holds the error taxonomy shared by every layer and the subject
//! naming rules (prefixing, taxonomy, durable consumer names). No IO lives here.

pub mod error;
pub mod subject;

pub use error::{Error, Result};
pub use subject::{Subject, SubjectFamily, durable_consumer_name, matches, validate_prefix};
