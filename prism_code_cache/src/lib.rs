//! Prism JIT Code Cache
//!
//! Executable memory for just-in-time compiled methods: allocation, ownership
//! tracking, and reclamation of code that no thread is running.
//!
//! # Architecture
//!
//! One address reservation is split in two halves:
//!
//! - **Data half** (read-write): mapping tables, value maps, GC maps and
//!   profiling records.
//! - **Code half** (read-execute): a [`MethodHeader`] followed by native
//!   instructions for each committed method. Writable only inside a
//!   [`ScopedCodeWrite`].
//!
//! Each half has its own first-fit allocator with a soft footprint limit;
//! together the limits form the cache's current capacity, which grows up to
//! the reservation size.
//!
//! # Collection
//!
//! When an allocation fails the cache runs one collection cycle and retries
//! once. A cycle either grows the capacity or sweeps. Sweeping never stops
//! the world: every method is pointed back at the interpreter bridge, each
//! thread marks the code on its own stack from a [`Checkpoint`], and
//! unmarked code is freed.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use prism_code_cache::{CodeCache, CodeCacheConfig, CompiledCode, ThreadRegistry};
//!
//! let threads = Arc::new(ThreadRegistry::new());
//! let cache = CodeCache::create(CodeCacheConfig::from_env()?, bridge, threads)?;
//!
//! match cache.commit(&method, &CompiledCode::new(&machine_code)) {
//!     Some(header) => log::debug!("installed at {:p}", header.code_ptr()),
//!     None => { /* stay interpreted */ }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocator;
pub mod bitmap;
pub mod catalog;
pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod header;
pub mod method;
pub mod profiling;
pub mod region;

mod cache;
mod error;
mod stats;

// Re-exports for convenient access
pub use cache::{CodeCache, CompiledCode};
pub use checkpoint::{
    Barrier, Checkpoint, ScopedThreadSuspension, StackWalker, ThreadList, ThreadRegistry,
    ThreadState,
};
pub use collector::{CollectionOutcome, CollectorPhase};
pub use config::{CodeCacheConfig, ConfigError};
pub use error::CodeCacheError;
pub use header::{FrameInfo, HeaderRef, MethodHeader};
pub use method::{JitMethod, MethodId, MethodRef, MethodSlot, OwnerId};
pub use profiling::{InlineCache, ProfilingRecord, ProfilingRecordRef};
pub use region::{ReservedRegion, ScopedCodeWrite};
pub use stats::{CodeCacheInfo, CodeCacheStats};
