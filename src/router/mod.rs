//! Routing core: health probing, fallback selection, usage metrics.

mod fallback;
mod health;
mod metrics;

#[cfg(test)]
pub(crate) mod testing;

pub use fallback::*;
pub use health::*;
pub use metrics::*;
