//! Core data models for switchboard.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants absorbed into routing decisions

mod config;
mod error;
mod routing;

pub use config::*;
pub use error::*;
pub use routing::*;
