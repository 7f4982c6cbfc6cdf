//! Userlimit - user-aware HTTP rate limiting
//!
//! This crate implements the request rate limiter of the bookmarks backend.
//! Requests are counted per requester (authenticated user, session or client
//! address) inside a sliding window held in process memory, with a periodic
//! sweep that drops identities which have gone quiet.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
