//! Search query language.
//!
//! This module provides:
//! - `expression` - predicate tree node types
//! - `parser` - tokenizer and grammar
//! - `text_match` - literal and wildcard matching
//! - `matcher` - `CompiledQuery`, the evaluable form of a raw string
//! - `refine` - decides when a new query only narrows the previous one
//! - `cache` - bounded cache of compiled queries

mod cache;
mod expression;
mod matcher;
mod parser;
mod refine;
mod text_match;

pub use cache::QueryCache;
pub use expression::{MatchTarget, QueryNode, Term};
pub use matcher::CompiledQuery;
pub use parser::QueryParser;
pub use refine::is_refinement;
pub use text_match::wildcard_matches;

pub(crate) use matcher::NameNeedle;
