// Copyright 2018-2026 the Deno authors. MIT license.

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// A one-way completion signal: a broadcast channel that is closed when
/// the watched operation finishes.
///
/// Waiters never receive a value; they observe the channel closing. `set`
/// is idempotent, and waits after `set` return immediately.
#[derive(Debug)]
pub struct ReadyFlag {
  sender: Mutex<Option<broadcast::Sender<()>>>,
}

impl ReadyFlag {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(1);
    Self {
      sender: Mutex::new(Some(tx)),
    }
  }

  /// Signal completion, unblocking every current and future waiter.
  pub fn set(&self) {
    self.sender.lock().take();
  }

  pub fn is_set(&self) -> bool {
    self.sender.lock().is_none()
  }

  fn subscribe(&self) -> Option<broadcast::Receiver<()>> {
    self.sender.lock().as_ref().map(|tx| tx.subscribe())
  }

  /// Wait for the flag from an async task.
  pub async fn wait(&self) {
    if let Some(mut rx) = self.subscribe() {
      // The sender is dropped on `set`, surfacing as `Closed`.
      let _ = rx.recv().await;
    }
  }

  /// Wait for the flag from a thread that is not driving a runtime.
  pub fn wait_blocking(&self) {
    if let Some(mut rx) = self.subscribe() {
      let _ = rx.blocking_recv();
    }
  }
}

impl Default for ReadyFlag {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::time::Duration;

  use super::*;

  #[test]
  fn set_is_idempotent() {
    let flag = ReadyFlag::new();
    assert!(!flag.is_set());
    flag.set();
    flag.set();
    assert!(flag.is_set());
    flag.wait_blocking();
  }

  #[test]
  fn blocking_wait_unblocks_on_set() {
    let flag = Arc::new(ReadyFlag::new());
    let waiter = {
      let flag = flag.clone();
      std::thread::spawn(move || flag.wait_blocking())
    };
    std::thread::sleep(Duration::from_millis(20));
    flag.set();
    waiter.join().unwrap();
  }

  #[tokio::test]
  async fn async_wait_unblocks_on_set() {
    let flag = Arc::new(ReadyFlag::new());
    let waiter = {
      let flag = flag.clone();
      tokio::spawn(async move { flag.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    flag.set();
    waiter.await.unwrap();
  }
}
