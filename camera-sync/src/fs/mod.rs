//! Local filesystem helpers: directory walking, timestamps and free space.

pub mod metadata;
pub mod space;
pub mod walker;
