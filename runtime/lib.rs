// Copyright 2018-2026 the Deno authors. MIT license.

//! A local host runtime for Compute@Edge (XQD) wasm programs.
//!
//! The embedder configures named backends, stores and lookup functions
//! through [`config::RuntimeConfig`], compiles a program once into an
//! [`instance::ExecuteCtx`], and serves HTTP with [`downstream::serve`].
//! Each inbound request instantiates the guest fresh; everything the
//! guest touches goes through integer handles owned by the per-request
//! [`session::Session`].

pub mod abi;
pub mod async_io;
pub mod body;
pub mod config;
pub mod downstream;
pub mod error;
pub mod handles;
pub mod http;
pub mod instance;
pub mod memory;
pub mod pending;
pub mod session;
pub mod uap;

pub use config::Backend;
pub use config::FnBackend;
pub use config::RuntimeConfig;
pub use config::TlsInfo;
pub use config::UriBackend;
pub use downstream::serve;
pub use error::FastlyStatus;
pub use error::HandlerError;
pub use instance::ExecuteCtx;
