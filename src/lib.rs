//! A two-regime interning dictionary for state-space exploration.
//!
//! Byte-string keys are deduplicated into stable, pointer-identified
//! entries. One structure serves two phases: a sequential phase where a
//! single thread inserts and the table may grow, and a concurrent phase
//! where many workers insert and look up in parallel. Lookups of
//! already-interned keys are lock-free in both phases; a concurrent insert
//! takes exactly one stripe lock, and the new entries are folded into the
//! lock-free lane at the next quiesced barrier.
//!
//! On top of the dictionary sits a tagged value layer for a model checker:
//! booleans, integers, atoms, program counters, dicts, sets, addresses, and
//! execution contexts, with each aggregate kind interned through its own
//! table so that structural equality collapses to handle equality.

pub mod alloc;
mod bucket;
pub mod dict;
mod hash;
pub mod json;
mod node;
pub mod strfmt;
pub mod value;

pub use crate::alloc::{Arena, DictAlloc, StdAlloc, StdArena, Worker};
pub use crate::dict::Dict;
pub use crate::json::JsonError;
pub use crate::node::NodeRef;
pub use crate::strfmt::ParseError;
pub use crate::value::{ContextRepr, Promoted, Value, ValuePool};
