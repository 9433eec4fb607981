//! Core functionality built on the storage layer: history queries, merging,
//! replaying commits and the sessions that let interrupted operations resume.

pub mod check_out;
pub mod dag;
pub mod merge;
pub mod rewrite;
pub mod session;
pub mod stash;
