// src/models/mod.rs

//! Domain models for the microblog engine.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod document;
mod post;
mod source;

// Re-export all public types
pub use config::{Config, CrawlerConfig, FeedConfig, TimelineConfig};
pub use document::{Channel, Document, ListRef, ParsedDocument, Rejected};
pub use post::{Kind, KindTag, Post, ReplyFields, RepostFields};
pub use source::Source;
