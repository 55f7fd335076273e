// Copyright 2018-2026 the Deno authors. MIT license.

//! Guest-visible HTTP bodies.
//!
//! A body is either a plain buffer (reads return what is present) or a
//! streaming channel (reads block until bytes arrive at the read offset
//! or the writer finishes). Both share the same underlying byte stream,
//! so a streaming body can be handed to concurrent host-side readers
//! while the writer is still producing.

use http::HeaderMap;
use xqd_sync::ByteStream;
use xqd_sync::StreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
  Buffer,
  Streaming,
}

#[derive(Debug)]
pub struct Body {
  kind: BodyKind,
  stream: ByteStream,
  read_offset: usize,
  trailers: HeaderMap,
}

impl Body {
  /// An empty writable buffer, as created by `fastly_http_body::new`.
  pub fn buffered() -> Self {
    Self::with_stream(BodyKind::Buffer, ByteStream::new())
  }

  /// A complete body received from the outside (downstream client or a
  /// backend); its length is known and reads never block.
  pub fn received(bytes: Vec<u8>) -> Self {
    let stream = ByteStream::from_bytes(bytes);
    stream.finish();
    Self::with_stream(BodyKind::Buffer, stream)
  }

  /// A reader over a stream another party is still writing.
  pub fn streaming(stream: ByteStream) -> Self {
    Self::with_stream(BodyKind::Streaming, stream)
  }

  /// The write half of a stream with host-side readers (cache inserts);
  /// guest reads on it never block.
  pub fn writer(stream: ByteStream) -> Self {
    Self::with_stream(BodyKind::Buffer, stream)
  }

  fn with_stream(kind: BodyKind, stream: ByteStream) -> Self {
    Self {
      kind,
      stream,
      read_offset: 0,
      trailers: HeaderMap::new(),
    }
  }

  pub fn kind(&self) -> BodyKind {
    self.kind
  }

  pub fn stream(&self) -> ByteStream {
    self.stream.clone()
  }

  pub fn read_offset(&self) -> usize {
    self.read_offset
  }

  /// Append bytes; with `end` set the body transitions to
  /// write-complete and accepts no further writes.
  pub fn write(&mut self, data: &[u8], end: bool) -> Result<usize, StreamError> {
    let written = self.stream.write(data)?;
    if end {
      self.stream.finish();
    }
    Ok(written)
  }

  /// Read up to `max` bytes from the current read offset. On a streaming
  /// body this blocks until data or EOF; an empty result means EOF.
  pub fn read(&mut self, max: usize) -> Result<Vec<u8>, StreamError> {
    let blocking = self.kind == BodyKind::Streaming;
    let chunk = self.stream.read_at(self.read_offset, max, blocking)?;
    self.read_offset += chunk.len();
    Ok(chunk)
  }

  /// Move the read cursor forward after an out-of-band read of the
  /// underlying stream.
  pub(crate) fn advance(&mut self, n: usize) {
    self.read_offset += n;
  }

  /// Known only for a buffer whose writer has finished.
  pub fn known_length(&self) -> Option<u64> {
    match self.kind {
      BodyKind::Buffer => self.stream.known_length(),
      BodyKind::Streaming => None,
    }
  }

  /// The bytes currently buffered, regardless of completion.
  pub fn current_len(&self) -> usize {
    self.stream.len()
  }

  pub fn abandon(&self) {
    self.stream.abandon();
  }

  /// Finish the write side; used when the guest closes the handle.
  pub fn finish(&self) {
    self.stream.finish();
  }

  pub fn is_write_complete(&self) -> bool {
    self.stream.is_finished()
  }

  pub fn trailers(&self) -> &HeaderMap {
    &self.trailers
  }

  /// Trailers freeze at write-complete.
  pub fn append_trailer(
    &mut self,
    name: http::header::HeaderName,
    value: http::header::HeaderValue,
  ) -> Result<(), StreamError> {
    if self.stream.is_finished() {
      return Err(StreamError::Finished);
    }
    self.trailers.append(name, value);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn buffered_reads_are_a_prefix_of_writes() {
    let mut body = Body::buffered();
    body.write(b"hello", false).unwrap();
    body.write(b" world", false).unwrap();
    assert_eq!(body.read(5).unwrap(), b"hello");
    assert_eq!(body.read(100).unwrap(), b" world");
    // not finished: no known length, reads do not block
    assert_eq!(body.known_length(), None);
    assert_eq!(body.read(10).unwrap(), b"");
    body.write(b"!", true).unwrap();
    assert_eq!(body.known_length(), Some(12));
    assert_eq!(body.read(10).unwrap(), b"!");
    // drained after finish: EOF
    assert_eq!(body.read(10).unwrap(), b"");
  }

  #[test]
  fn write_after_end_flag_is_rejected() {
    let mut body = Body::buffered();
    body.write(b"x", true).unwrap();
    assert_eq!(body.write(b"y", false), Err(StreamError::Finished));
  }

  #[test]
  fn received_bodies_know_their_length() {
    let mut body = Body::received(b"abc".to_vec());
    assert_eq!(body.known_length(), Some(3));
    assert_eq!(body.read(2).unwrap(), b"ab");
    assert_eq!(body.read(2).unwrap(), b"c");
    assert_eq!(body.read(2).unwrap(), b"");
  }

  #[test]
  fn streaming_bodies_have_no_known_length_until_finished() {
    let stream = ByteStream::new();
    let body = Body::streaming(stream.clone());
    stream.write(b"abc").unwrap();
    assert_eq!(body.known_length(), None);
    stream.finish();
    // even finished, length is reported through the stream only
    assert_eq!(body.known_length(), None);
    assert_eq!(body.stream().known_length(), Some(3));
  }

  #[test]
  fn trailers_freeze_at_write_complete() {
    let mut body = Body::buffered();
    body
      .append_trailer(
        http::header::HeaderName::from_static("x-checksum"),
        http::header::HeaderValue::from_static("abc"),
      )
      .unwrap();
    body.write(b"payload", true).unwrap();
    let err = body.append_trailer(
      http::header::HeaderName::from_static("x-late"),
      http::header::HeaderValue::from_static("nope"),
    );
    assert_eq!(err, Err(StreamError::Finished));
    assert_eq!(body.trailers().len(), 1);
  }
}
