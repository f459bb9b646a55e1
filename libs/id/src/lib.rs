//! # quarry-id
//!
//! Operation keys and synthesized ids for the quarry engine.
//!
//! ## Design Principles
//!
//! - A key's string form *is* its identity: two keys with the same namespace
//!   address the same cached operation
//! - Keys are typed per operation kind so a query key can never be used to
//!   look up a mutation
//! - Wildcards live only in [`KeyPattern`], never in a key itself
//!
//! ## Key Format
//!
//! Keys are `/`-separated, non-empty segments:
//!
//! - `users`
//! - `users/42`
//! - `users/42/posts`
//!
//! Patterns use `*` for "any one segment"; a trailing `*` also swallows every
//! remaining segment, so `users/*` matches both `users/42` and
//! `users/42/posts`.
//!
//! Combinators have no natural key, so they get a ULID-backed
//! [`CombinedQueryId`] in the `{prefix}_{ulid}` format instead.

mod error;
mod macros;
mod pattern;
mod types;

pub use error::KeyError;
pub use pattern::{validate_key, KeyPattern};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
