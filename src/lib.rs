// src/lib.rs

//! Microblog feed engine: feed documents, crawling and timeline merging.

pub mod codec;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
