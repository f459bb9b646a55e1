//! Typed key definitions for every operation kind.
//!
//! Query, mutation and subscription keys are namespaced strings chosen by the
//! caller. Combinators are addressed by a synthesized ULID id.

use crate::{define_id, define_key};

// =============================================================================
// Operation Keys
// =============================================================================

define_key!(QueryId, "query");
define_key!(MutationId, "mutation");
define_key!(SubscriptionId, "subscription");

// =============================================================================
// Synthesized Ids
// =============================================================================

define_id!(CombinedQueryId, "cq");

// =============================================================================
// Tests
// =============================================================================
