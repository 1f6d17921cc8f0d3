//! Lock-free building blocks
//!
//! Contended compare-and-swap loops go through [`retry_bounded`] or
//! [`retry_until`]; ABA-sensitive heads are the packed words in [`tagged`].

mod backoff;
pub mod tagged;

pub use backoff::{retry_bounded, retry_until, Attempt};
pub use tagged::{AtomicTaggedPtr, AtomicVersionedIndex, TaggedPtr, VersionedIndex};
