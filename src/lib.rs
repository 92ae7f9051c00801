//! Lightning: a community forum backend built around a cache-aside read path.
//!
//! Reads go through an existence filter, a request coalescer and the cache before touching
//! Postgres. Votes update the cache synchronously and reach the database through a durable event
//! log; row insert events warm the cache.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod ingest;
pub mod util;
