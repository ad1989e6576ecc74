//! Common test infrastructure
//!
//! Integration tests drive the public orchestrator API against a real SQLite
//! store in a temp directory and a scripted extraction engine.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{FakeExtractorFactory, TestLibrary};
//!
//! let library = TestLibrary::new();
//! library.add_track("t1", "tempo:120");
//! let factory = FakeExtractorFactory::new();
//! let summary = library.orchestrator(factory, 1).analyze_pending(None).unwrap();
//! assert_eq!(summary.saved, 1);
//! ```

#![allow(dead_code, unused_imports)]

mod constants;
mod engine;
mod fixtures;

pub use constants::*;
pub use engine::FakeExtractorFactory;
pub use fixtures::TestLibrary;
