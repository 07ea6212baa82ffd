//! # client-ratelimit
//!
//! `client-ratelimit` is a per-client token bucket rate limiter with a
//! middleware adapter for the `ntex` web framework.
//!
//! ## Features
//!
//! - **Token Bucket Algorithm**: Each client gets a bucket that starts full,
//!   gains one whole token per refill interval and never exceeds its capacity.
//! - **Exact Under Contention**: A bucket with capacity `K` admits exactly `K`
//!   of any number of simultaneous callers; concurrent first requests from a
//!   new client share one bucket.
//! - **Injectable Clock**: Time comes from a [`Clock`]; tests drive a
//!   [`ManualClock`] instead of sleeping.
//! - **Optional Stale Sweep**: Idle buckets can be removed periodically on the
//!   enabled runtime. Off unless a stale threshold is configured.
//! - **ntex Middleware**: Identifies clients by IP address (honouring
//!   `X-Forwarded-For` and `X-Real-IP`), adds `X-RateLimit-*` headers and
//!   answers `429 Too Many Requests` with a JSON body when a client runs dry.
//!
//! ## Feature Flags
//!
//! - `tokio` (default): Runs the stale sweep on Tokio.
//! - `async-std`: Runs the stale sweep on async-std.
//! - `json` (default): Serializes rejection bodies with `serde`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ntex::web;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use client_ratelimit::{ClientRegistry, RateLimit};
//!
//! #[ntex::main]
//! async fn main() -> std::io::Result<()> {
//!     // 5 request burst, one more every second
//!     let registry = Arc::new(ClientRegistry::new(5, Duration::from_secs(1)).unwrap());
//!
//!     web::HttpServer::new(move || {
//!         web::App::new()
//!             .wrap(RateLimit::new(registry.clone()))
//!             .service(web::resource("/ping").to(|| async { "pong" }))
//!     })
//!     .bind("127.0.0.1:8080")?
//!     .run()
//!     .await
//! }
//! ```
//!
//! ## Module Structure
//!
//! - `bucket`: [`TokenBucket`], the refill-and-consume algorithm.
//! - `registry`: [`ClientRegistry`], one bucket per client identifier.
//! - `middleware`: [`RateLimit`], the ntex adapter.
//! - `clock`, `config`, `error`: time source, settings and error types.

mod bucket;
mod clock;
mod config;
mod error;
mod middleware;
mod registry;

pub use bucket::{Acquisition, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RegistryConfig;
pub use error::{ConfigError, RateLimitError, Result};
pub use middleware::{extract_client_id, RateLimit, RateLimitMiddlewareService, UNKNOWN_CLIENT};
pub use registry::{ClientRegistry, RateLimitResult, RegistryStats};

// Prevent conflicting runtime features
#[cfg(all(feature = "tokio", feature = "async-std"))]
compile_error!("Features \"tokio\" and \"async-std\" cannot be enabled at the same time.");

#[cfg(not(any(feature = "tokio", feature = "async-std")))]
compile_error!("Enable either feature \"tokio\" or \"async-std\" for client-ratelimit to work.");

#[cfg(feature = "tokio")]
pub use tokio;

#[cfg(feature = "async-std")]
pub use async_std;
