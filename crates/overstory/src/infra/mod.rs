//! Infrastructure: durable stores and subprocess drivers.

use std::future::Future;
use std::pin::Pin;

pub mod ai;
pub mod db;
pub mod git;
pub mod mux;
pub mod proc;

/// Boxed async result used by object-safe driver traits.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
