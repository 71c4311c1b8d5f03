//! Built-in handlers. These produce deterministic placeholder output so the
//! settlement pipeline can be exercised end to end without model backends.

pub mod compute;
pub mod media;
pub mod text;
