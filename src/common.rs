//! Definitions shared across the compiler.

// Sorted collections so output and tests iterate deterministically
pub use std::collections::BTreeSet as Set;

/// Interned identifiers (variable, function, and global names).
pub type Id = internment::Intern<String>;
