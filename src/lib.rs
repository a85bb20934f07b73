//! `treecopy`:
//! Recursive filesystem copy engine.
//!
//! One logical algorithm, two execution dialects plus a callback wrapper:
//! - `copy`       : blocking traversal and copy orchestration
//! - `copy_async` : the same traversal over `tokio::fs`
//! - `spec`       : enums/options/errors
//! - `util`       : shared predicates and helper functions

pub mod copy;
pub mod copy_async;
pub mod spec;
mod util;

pub use copy::{copy_tree, copy_tree_with_callback};
pub use copy_async::copy_tree as copy_tree_async;
pub use spec::{
    CopyTreeError, EnumEntryKind, SpecCopyOptions, TypeCopyFilter, filter_from_globs,
};
