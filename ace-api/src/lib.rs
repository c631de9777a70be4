//! HTTP remote facade for the analysis orchestration core.
//!
//! The server side ([`api::create_router`]) exposes each core operation as
//! one endpoint; the client side ([`client::RemoteCore`]) mirrors the same
//! operations so local and remote cores are interchangeable.

pub mod api;
pub mod auth;
pub mod client;
pub mod error;

pub use api::{create_router, ApiState};
pub use client::RemoteCore;
pub use error::ApiError;
