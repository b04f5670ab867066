//! Identity service access.
//!
//! This module provides the `IdentityService` contract the session lifecycle
//! depends on (validate once at startup, refresh periodically) and
//! `HttpIdentityClient`, its REST implementation.

pub mod client;
pub mod error;
pub mod identity;

pub use client::HttpIdentityClient;
pub use error::IdentityError;
pub use identity::{IdentityService, Validation};
