// Copyright 2018-2026 the Deno authors. MIT license.

use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
  #[error("stream is already finished")]
  Finished,
  #[error("stream was abandoned")]
  Abandoned,
}

#[derive(Debug, Default)]
struct StreamState {
  buf: Vec<u8>,
  finished: bool,
  abandoned: bool,
}

#[derive(Debug)]
struct Inner {
  state: Mutex<StreamState>,
  cond: Condvar,
  notify: Notify,
}

/// An ordered byte channel with a terminal "write complete" flag.
///
/// Writers append and eventually call [`finish`][ByteStream::finish];
/// readers consume at explicit offsets and may block (or await) until
/// bytes exist at that offset or the writer has finished. Multiple
/// readers at independent offsets are supported while a writer is still
/// producing, which is what the cache's streaming insert relies on.
#[derive(Debug, Clone)]
pub struct ByteStream {
  inner: Arc<Inner>,
}

impl ByteStream {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(StreamState::default()),
        cond: Condvar::new(),
        notify: Notify::new(),
      }),
    }
  }

  pub fn from_bytes(bytes: Vec<u8>) -> Self {
    let stream = Self::new();
    {
      let mut state = stream.inner.state.lock();
      state.buf = bytes;
    }
    stream
  }

  fn wake_all(&self) {
    self.inner.cond.notify_all();
    self.inner.notify.notify_waiters();
  }

  /// Append bytes. Fails once the stream is finished or abandoned.
  pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
    {
      let mut state = self.inner.state.lock();
      if state.abandoned {
        return Err(StreamError::Abandoned);
      }
      if state.finished {
        return Err(StreamError::Finished);
      }
      state.buf.extend_from_slice(data);
    }
    self.wake_all();
    Ok(data.len())
  }

  /// Mark the stream complete. Idempotent; readers at the tail unblock
  /// with EOF.
  pub fn finish(&self) {
    {
      let mut state = self.inner.state.lock();
      state.finished = true;
    }
    self.wake_all();
  }

  /// Drop buffered data and poison the stream. Legal at any time.
  pub fn abandon(&self) {
    {
      let mut state = self.inner.state.lock();
      state.buf = Vec::new();
      state.abandoned = true;
      state.finished = true;
    }
    self.wake_all();
  }

  pub fn len(&self) -> usize {
    self.inner.state.lock().buf.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_finished(&self) -> bool {
    self.inner.state.lock().finished
  }

  pub fn is_abandoned(&self) -> bool {
    self.inner.state.lock().abandoned
  }

  /// The total length, known only once the writer has finished.
  pub fn known_length(&self) -> Option<u64> {
    let state = self.inner.state.lock();
    if state.finished && !state.abandoned {
      Some(state.buf.len() as u64)
    } else {
      None
    }
  }

  /// Read up to `max` bytes starting at `offset`.
  ///
  /// With `blocking` set, waits until bytes exist at `offset` or the
  /// stream finishes; an empty result then means EOF. Without it, returns
  /// whatever is currently present.
  pub fn read_at(
    &self,
    offset: usize,
    max: usize,
    blocking: bool,
  ) -> Result<Vec<u8>, StreamError> {
    let mut state = self.inner.state.lock();
    loop {
      if state.abandoned {
        return Err(StreamError::Abandoned);
      }
      if offset < state.buf.len() {
        let end = std::cmp::min(state.buf.len(), offset + max);
        return Ok(state.buf[offset..end].to_vec());
      }
      if state.finished || !blocking {
        return Ok(Vec::new());
      }
      self.inner.cond.wait(&mut state);
    }
  }

  /// Block until the stream finishes, then return everything at and past
  /// `offset`.
  pub fn read_to_end_blocking(
    &self,
    offset: usize,
  ) -> Result<Vec<u8>, StreamError> {
    let mut state = self.inner.state.lock();
    while !state.finished {
      self.inner.cond.wait(&mut state);
    }
    if state.abandoned {
      return Err(StreamError::Abandoned);
    }
    if offset >= state.buf.len() {
      return Ok(Vec::new());
    }
    Ok(state.buf[offset..].to_vec())
  }

  /// A copy of the bytes currently buffered.
  pub fn content(&self) -> Result<Vec<u8>, StreamError> {
    let state = self.inner.state.lock();
    if state.abandoned {
      return Err(StreamError::Abandoned);
    }
    Ok(state.buf.clone())
  }

  /// True when a read at `offset` would not block: bytes exist there, or
  /// the stream has terminated.
  pub fn is_ready_at(&self, offset: usize) -> bool {
    let state = self.inner.state.lock();
    state.abandoned || state.finished || offset < state.buf.len()
  }

  /// Await readiness at `offset` from an async task.
  pub async fn ready_at(&self, offset: usize) {
    loop {
      let notified = self.inner.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.is_ready_at(offset) {
        return;
      }
      notified.await;
    }
  }
}

impl Default for ByteStream {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  #[test]
  fn buffered_read_is_a_prefix_of_writes() {
    let stream = ByteStream::new();
    stream.write(b"hello ").unwrap();
    stream.write(b"world").unwrap();
    assert_eq!(stream.read_at(0, 5, false).unwrap(), b"hello");
    assert_eq!(stream.read_at(5, 100, false).unwrap(), b" world");
    // nothing at the tail and not finished: empty, no block
    assert_eq!(stream.read_at(11, 10, false).unwrap(), b"");
    assert_eq!(stream.known_length(), None);
    stream.finish();
    assert_eq!(stream.known_length(), Some(11));
  }

  #[test]
  fn write_after_finish_is_rejected() {
    let stream = ByteStream::new();
    stream.finish();
    assert_eq!(stream.write(b"x"), Err(StreamError::Finished));
  }

  #[test]
  fn blocking_reader_sees_writer_progress_then_eof() {
    let stream = ByteStream::new();
    let reader = {
      let stream = stream.clone();
      std::thread::spawn(move || {
        let first = stream.read_at(0, 3, true).unwrap();
        let second = stream.read_at(3, 100, true).unwrap();
        let eof = stream.read_at(5, 100, true).unwrap();
        (first, second, eof)
      })
    };
    std::thread::sleep(Duration::from_millis(20));
    stream.write(b"abc").unwrap();
    std::thread::sleep(Duration::from_millis(20));
    stream.write(b"de").unwrap();
    stream.finish();
    let (first, second, eof) = reader.join().unwrap();
    assert_eq!(first, b"abc");
    assert_eq!(second, b"de");
    assert!(eof.is_empty());
  }

  #[test]
  fn abandon_unblocks_readers_with_error() {
    let stream = ByteStream::new();
    let reader = {
      let stream = stream.clone();
      std::thread::spawn(move || stream.read_at(0, 1, true))
    };
    std::thread::sleep(Duration::from_millis(20));
    stream.abandon();
    assert_eq!(reader.join().unwrap(), Err(StreamError::Abandoned));
    assert_eq!(stream.known_length(), None);
  }

  #[tokio::test]
  async fn async_readiness_fires_on_write_and_finish() {
    let stream = ByteStream::new();
    assert!(!stream.is_ready_at(0));
    {
      let stream = stream.clone();
      tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.write(b"x").unwrap();
      });
    }
    stream.ready_at(0).await;
    assert!(stream.is_ready_at(0));
    assert!(!stream.is_ready_at(1));
    stream.finish();
    stream.ready_at(1).await;
  }
}
