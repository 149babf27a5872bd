//! HTTP plumbing: messages, the network seam and the named response caches.

mod message;
mod network;
mod response_cache;

pub use message::{Headers, Request, Response};
pub use network::{HttpNetwork, Network};
pub use response_cache::{NamedCache, PutOutcome, ResponseCache};
