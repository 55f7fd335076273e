// Copyright 2018-2026 the Deno authors. MIT license.

use std::fmt;

/// Numeric status returned by every hostcall.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct FastlyStatus {
  pub code: u32,
}

impl FastlyStatus {
  /// Success.
  pub const OK: Self = Self { code: 0 };
  /// Generic error.
  pub const ERROR: Self = Self { code: 1 };
  /// Invalid argument.
  pub const INVAL: Self = Self { code: 2 };
  /// Invalid handle.
  pub const BADF: Self = Self { code: 3 };
  /// Buffer length error: the caller's output buffer was too small. The
  /// required size is reported through the `nwritten` out-parameter.
  pub const BUFLEN: Self = Self { code: 4 };
  /// Unsupported operation.
  pub const UNSUPPORTED: Self = Self { code: 5 };
  /// Alignment error.
  pub const BADALIGN: Self = Self { code: 6 };
  /// Invalid HTTP value (method, URI or header).
  pub const HTTPINVALID: Self = Self { code: 7 };
  /// User-caused HTTP error, e.g. conflicting framing headers.
  pub const HTTPUSER: Self = Self { code: 8 };
  /// A stream ended unexpectedly.
  pub const HTTPINCOMPLETE: Self = Self { code: 9 };
  /// An optional value was absent, as opposed to empty.
  pub const NONE: Self = Self { code: 10 };

  pub fn is_ok(&self) -> bool {
    *self == Self::OK
  }
}

impl fmt::Debug for FastlyStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match *self {
      Self::OK => "OK",
      Self::ERROR => "ERROR",
      Self::INVAL => "INVAL",
      Self::BADF => "BADF",
      Self::BUFLEN => "BUFLEN",
      Self::UNSUPPORTED => "UNSUPPORTED",
      Self::BADALIGN => "BADALIGN",
      Self::HTTPINVALID => "HTTP_INVALID",
      Self::HTTPUSER => "HTTP_USER",
      Self::HTTPINCOMPLETE => "HTTP_INCOMPLETE",
      Self::NONE => "NONE",
      _ => "UNKNOWN",
    })
  }
}

impl From<crate::memory::OutOfBounds> for FastlyStatus {
  fn from(_: crate::memory::OutOfBounds) -> Self {
    Self::ERROR
  }
}

impl From<xqd_sync::StreamError> for FastlyStatus {
  fn from(_: xqd_sync::StreamError) -> Self {
    Self::ERROR
  }
}

impl From<xqd_cache::CacheError> for FastlyStatus {
  fn from(_: xqd_cache::CacheError) -> Self {
    Self::ERROR
  }
}

impl From<std::str::Utf8Error> for FastlyStatus {
  fn from(_: std::str::Utf8Error) -> Self {
    Self::ERROR
  }
}

impl From<http::method::InvalidMethod> for FastlyStatus {
  fn from(_: http::method::InvalidMethod) -> Self {
    Self::HTTPINVALID
  }
}

impl From<http::header::InvalidHeaderName> for FastlyStatus {
  fn from(_: http::header::InvalidHeaderName) -> Self {
    Self::HTTPINVALID
  }
}

impl From<http::header::InvalidHeaderValue> for FastlyStatus {
  fn from(_: http::header::InvalidHeaderValue) -> Self {
    Self::HTTPINVALID
  }
}

impl From<http::status::InvalidStatusCode> for FastlyStatus {
  fn from(_: http::status::InvalidStatusCode) -> Self {
    Self::HTTPINVALID
  }
}

impl From<url::ParseError> for FastlyStatus {
  fn from(_: url::ParseError) -> Self {
    Self::HTTPINVALID
  }
}

/// Errors surfaced by the embedding boundary rather than a hostcall.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
  #[error("guest trapped: {0}")]
  GuestTrap(#[source] anyhow::Error),
  #[error("guest finished without sending a downstream response")]
  NoResponse,
  #[error("downstream body read failed")]
  DownstreamBody,
}
