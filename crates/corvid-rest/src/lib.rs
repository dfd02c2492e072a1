//! Corvid REST
//!
//! Request/response half of the corvid client library: a bucketed rate
//! limiter that serializes and paces outbound calls, and the HTTP client
//! that routes every API request through it. Endpoint wrappers are supplied
//! by callers; this crate only knows buckets, methods, paths, and
//! parameters.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod client;
pub mod error;
pub mod limiter;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use client::{GatewayEndpoint, RestClient, RestConfig, DEFAULT_API_BASE};
pub use error::{RestError, Result};
pub use limiter::{LimitInfo, RateLimiter, SubmitError};
