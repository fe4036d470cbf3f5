//! Pipeline entry points for CLI operations.
//!
//! - `run_crawler`: Crawl an account's follows, once or continuously
//! - `run_validate`: Check the configuration file

pub mod crawl;
pub mod validate;

pub use crawl::run_crawler;
pub use validate::run_validate;
