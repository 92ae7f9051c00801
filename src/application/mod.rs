//! Application services: cache-aside reads, writes, votes and pagination.

pub mod changes;
pub mod communities;
pub mod error;
pub mod ids;
pub mod pagination;
pub mod posts;
pub mod repos;
pub mod votes;
