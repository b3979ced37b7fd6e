//! Translated code fragments and the caches that hold them.

pub mod cache;
pub mod fragment;
pub mod jump_cache;
pub mod translator;
