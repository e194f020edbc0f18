//! Modimizer sketches for long reads.
//!
//! A modimizer is a k-mer whose salted canonical hash is divisible by w;
//! the modset maps each such k-mer to a dense identity with a depth count
//! and annotation bits. Read sets store reads as ordered lists of modset
//! hits with gaps, and the overlap, layout and cleaning passes work on
//! that representation alone.

#[macro_use]
pub mod rdbg;

pub mod new_types;

pub mod cleaner;
pub mod layout;
pub mod modset;
pub mod overlap;
pub mod readset;
pub mod reference;
pub mod seqhash;
pub mod seqio;
