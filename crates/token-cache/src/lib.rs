//! Client-side credential cache for bearer and access tokens
//!
//! Given a logical key identifying a credential slot, the stores hand back a
//! still-valid token, invoking a caller-supplied refresh callback when the
//! cached token is missing or expired. Refreshes are single-flight per store
//! instance: a global refresh lock collapses concurrent misses into one
//! callback execution at a time. The cache is agnostic to how tokens are
//! obtained — OAuth2 flows, transport, and user interaction live in the
//! caller, which enters only through the refresh callback.
//!
//! Two stores, layered:
//! 1. [`MemoryTokenStore`] — concurrency-safe in-memory key → (token,
//!    expiry) map with lazy eviction on expired reads.
//! 2. [`PersistentTokenStore`] — the same contract backed by a JSON file,
//!    with mtime-based reload so separate instances (or processes) sharing
//!    a path observe each other's writes. Persistence is best-effort; file
//!    I/O failures are logged and never break in-memory behavior.
//!
//! Token ingestion accepts two shapes: JWT-style *bearer* tokens whose
//! expiry comes from the embedded `exp` claim, and opaque *access* tokens
//! whose lifetime is supplied explicitly in seconds.

pub mod clock;
pub mod error;
pub mod memory;
pub mod persistent;

mod bearer;

pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use memory::{MemoryTokenStore, RefreshResult, Refreshed};
pub use persistent::PersistentTokenStore;
