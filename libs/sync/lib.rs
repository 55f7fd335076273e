// Copyright 2018-2026 the Deno authors. MIT license.

//! Synchronization primitives shared by the body model, the cache engine
//! and the async coordinator.
//!
//! Guest execution is single-threaded and blocks on hostcalls, while the
//! host side runs background tasks on tokio. Everything here is therefore
//! usable from both worlds: blocking waits for the guest thread, async
//! waits for host tasks.

mod ready;
mod stream;

pub use ready::ReadyFlag;
pub use stream::ByteStream;
pub use stream::StreamError;
