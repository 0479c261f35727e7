//! Rate limiting and batch aggregation for image-generation requests.
//!
//! This crate is the admission and dispatch core of a chat-bot image
//! pipeline. It provides:
//! - [`RateLimiter`]: per-user fixed-window admission control with atomic
//!   check-and-increment
//! - [`BatchAggregator`]: groups requests over a short window and dispatches
//!   them in one backend call, trading latency for a per-image cost discount
//! - [`GenerationBackend`]: the abstract capability the core invokes; the
//!   application supplies the actual client
//!
//! The command layer (Discord or otherwise) and the backend wire format are
//! external collaborators. The core performs no I/O of its own beyond timers.
//!
//! # Example
//! ```ignore
//! use volley::{BatchAggregator, CoreConfig, Decision, RateLimiter, SystemClock};
//!
//! let config = CoreConfig::default();
//! let limiter = RateLimiter::new(&config)?;
//! let aggregator = BatchAggregator::new(backend, Arc::new(SystemClock), &config)?;
//!
//! match limiter.check_and_increment(&user_id, clock.now()) {
//!     Decision::Admitted { .. } => {
//!         let ticket = aggregator.submit(payload);
//!         let image = ticket.wait().await?;
//!     }
//!     Decision::Rejected { retry_after } => {
//!         // surface retry_after to the user
//!     }
//! }
//! ```

pub mod backend;
pub mod batch;
pub mod clock;
pub mod config;
pub mod cost;
pub mod error;
pub mod limiter;
pub mod types;

// Re-export commonly used types
pub use backend::{GenerationBackend, MockBackend};
pub use batch::{BatchAggregator, BatchTicket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoreConfig;
pub use cost::{BatchPricing, SavingsEstimate};
pub use error::{Result, VolleyError};
pub use limiter::{Decision, RateLimiter, UsageStatus};
pub use types::{BatchId, EntryId, GenerationOutput, GenerationPayload};
