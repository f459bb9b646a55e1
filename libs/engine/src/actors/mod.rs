//! Actor framework and operation actors.
//!
//! ## Design Principles
//!
//! - **One actor per key**: each actor owns the state of a single query,
//!   mutation or subscription and is the only writer of its state channel
//! - **Serialized commands**: commands for one key run one at a time, in
//!   submission order
//! - **Cancellation is not failure**: closing an actor drops its in-flight
//!   command; observers never see a cancelled fetch as an error
//!
//! ## Actor Types
//!
//! - `QueryActor`: cached reads, single-flight fetch, paging
//! - `MutationActor`: writes with cache-update and effect hooks
//! - `SubscriptionActor`: streamed reads with reset

mod framework;
pub(crate) mod mutation;
pub(crate) mod query;
pub(crate) mod subscription;

pub use framework::{Actor, ActorContext, ActorHandle, Message};
pub use mutation::{MutateResult, MutationHandle, QueryEffect};
pub use query::{QueryHandle, QueryUpdater};
pub use subscription::SubscriptionHandle;
