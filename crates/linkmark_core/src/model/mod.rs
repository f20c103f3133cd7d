//! Conflict-free document model for a bookmark collection.
//!
//! Entities are bags of last-writer-wins registers plus an add-wins tag set;
//! all mutation flows through [`crate::op::Operation`]s so that every replica
//! applying the same operation set converges to the same document.

mod document;
mod entity;
mod replica;

pub use document::{Document, TagCounts};
pub use entity::{Bookmark, Folder, Register, TagSet};
pub use replica::Replica;
