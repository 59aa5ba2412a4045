// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A single-consumer bounded in-memory byte pipe
//!
//! Writers wait while the buffer is full; reads wait until bytes are buffered or the pipe
//! is closed. After close, buffered bytes remain readable and end-of-stream is reported
//! once the buffer drains.
use std::{
  io,
  pin::Pin,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  task::{Context, Poll, Waker},
};

use bytes::{Bytes, BytesMut};
use tokio::{io::AsyncWrite, sync::Notify};

pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
  #[error("Write to a closed pipe")]
  Closed,
  #[error("Pipe buffer is full")]
  Full,
}

impl From<PipeError> for io::Error {
  fn from(e: PipeError) -> Self {
    let kind = match e {
      PipeError::Closed => io::ErrorKind::BrokenPipe,
      PipeError::Full => io::ErrorKind::WouldBlock,
    };
    io::Error::new(kind, e)
  }
}

#[derive(Debug, Default)]
struct PipeState {
  buffer: BytesMut,
  closed: bool,
  /// Writer parked on a full buffer
  write_waker: Option<Waker>,
}

#[derive(Debug)]
pub struct BytePipe {
  state: Mutex<PipeState>,
  readable: Notify,
  capacity: usize,
}

impl BytePipe {
  pub fn new() -> Arc<Self> {
    Self::with_capacity(DEFAULT_PIPE_CAPACITY)
  }

  pub fn with_capacity(capacity: usize) -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(PipeState::default()),
      readable: Notify::new(),
      capacity: capacity.max(1),
    })
  }

  fn lock(&self) -> MutexGuard<'_, PipeState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn append(&self, mut state: MutexGuard<'_, PipeState>, data: &[u8]) -> usize {
    let take = data.len().min(self.capacity - state.buffer.len());
    let was_empty = state.buffer.is_empty();
    state.buffer.extend_from_slice(&data[..take]);
    drop(state);
    if was_empty {
      self.readable.notify_one();
    }
    take
  }

  /// Appends as much of `data` as fits without waiting
  ///
  /// Zero-length writes succeed without waking the reader; a full buffer is an error.
  pub fn try_write(&self, data: &[u8]) -> Result<usize, PipeError> {
    let state = self.lock();
    if state.closed {
      return Err(PipeError::Closed);
    }
    if data.is_empty() {
      return Ok(0);
    }
    if state.buffer.len() >= self.capacity {
      return Err(PipeError::Full);
    }
    Ok(self.append(state, data))
  }

  fn poll_write_some(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<Result<usize, PipeError>> {
    let mut state = self.lock();
    if state.closed {
      return Poll::Ready(Err(PipeError::Closed));
    }
    if data.is_empty() {
      return Poll::Ready(Ok(0));
    }
    if state.buffer.len() >= self.capacity {
      state.write_waker = Some(cx.waker().clone());
      return Poll::Pending;
    }
    Poll::Ready(Ok(self.append(state, data)))
  }

  /// Appends a prefix of `data`, waiting for room; returns how many bytes were taken
  pub async fn write(&self, data: &[u8]) -> Result<usize, PipeError> {
    futures::future::poll_fn(|cx| self.poll_write_some(cx, data)).await
  }

  /// Reads up to `max` bytes, waiting until any are available
  ///
  /// Returns `None` once the pipe is closed and fully drained.
  pub async fn read(&self, max: usize) -> Option<Bytes> {
    let max = max.max(1);
    loop {
      {
        let mut state = self.lock();
        if !state.buffer.is_empty() {
          let take = max.min(state.buffer.len());
          let chunk = state.buffer.split_to(take).freeze();
          let writer = state.write_waker.take();
          drop(state);
          if let Some(writer) = writer {
            writer.wake();
          }
          return Some(chunk);
        }
        if state.closed {
          return None;
        }
      }
      // A write or close between the check and this wait leaves a stored permit
      self.readable.notified().await;
    }
  }

  /// Marks the pipe closed; idempotent
  pub fn close(&self) {
    let writer = {
      let mut state = self.lock();
      if state.closed {
        return;
      }
      state.closed = true;
      state.write_waker.take()
    };
    self.readable.notify_one();
    if let Some(writer) = writer {
      writer.wake();
    }
  }

  pub fn is_closed(&self) -> bool {
    self.lock().closed
  }

  pub fn buffered(&self) -> usize {
    self.lock().buffer.len()
  }
}

/// [AsyncWrite] adapter over a [BytePipe]; shutting it down closes the pipe
#[derive(Debug, Clone)]
pub struct PipeWriter {
  pipe: Arc<BytePipe>,
}

impl PipeWriter {
  pub fn new(pipe: Arc<BytePipe>) -> Self {
    Self { pipe }
  }
}

impl AsyncWrite for PipeWriter {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    self.pipe.poll_write_some(cx, buf).map_err(io::Error::from)
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Poll::Ready(Ok(()))
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.pipe.close();
    Poll::Ready(Ok(()))
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::AsyncWriteExt;

  use super::{BytePipe, PipeError, PipeWriter};

  #[tokio::test]
  async fn reads_in_order_and_respects_max() {
    let pipe = BytePipe::new();
    assert_eq!(pipe.write(b"hello ").await, Ok(6));
    assert_eq!(pipe.write(b"world").await, Ok(5));
    assert_eq!(pipe.read(4).await.as_deref(), Some(&b"hell"[..]));
    assert_eq!(pipe.read(100).await.as_deref(), Some(&b"o world"[..]));
  }

  #[tokio::test]
  async fn empty_write_then_close_ends_once() {
    let pipe = BytePipe::new();
    assert_eq!(pipe.write(b"").await, Ok(0));
    assert_eq!(pipe.buffered(), 0);
    pipe.close();
    assert_eq!(pipe.read(16).await, None);
  }

  #[tokio::test]
  async fn close_drains_then_ends() {
    let pipe = BytePipe::new();
    pipe.write(b"tail").await.unwrap();
    pipe.close();
    pipe.close();
    assert_eq!(pipe.write(b"x").await, Err(PipeError::Closed));
    assert_eq!(pipe.read(16).await.as_deref(), Some(&b"tail"[..]));
    assert_eq!(pipe.read(16).await, None);
    assert_eq!(pipe.read(16).await, None);
  }

  #[tokio::test]
  async fn reader_wakes_on_write_and_close() {
    let pipe = BytePipe::new();
    let reader = {
      let pipe = pipe.clone();
      tokio::spawn(async move {
        let mut got = Vec::new();
        while let Some(chunk) = pipe.read(3).await {
          got.extend_from_slice(&chunk);
        }
        got
      })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    pipe.write(b"abcdefg").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    pipe.write(b"hij").await.unwrap();
    pipe.close();
    assert_eq!(reader.await.unwrap(), b"abcdefghij".to_vec());
  }

  #[tokio::test]
  async fn writer_shutdown_closes_pipe() {
    let pipe = BytePipe::new();
    let mut writer = PipeWriter::new(pipe.clone());
    writer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    writer.shutdown().await.unwrap();
    assert!(pipe.is_closed());
    assert_eq!(
      pipe.read(1024).await.as_deref(),
      Some(&b"GET / HTTP/1.1\r\n\r\n"[..])
    );
    assert_eq!(pipe.read(1024).await, None);
  }

  #[tokio::test]
  async fn full_pipe_holds_writers_until_read() {
    let pipe = BytePipe::with_capacity(8);
    assert_eq!(pipe.try_write(b"0123456789"), Ok(8));
    assert_eq!(pipe.try_write(b"x"), Err(PipeError::Full));
    assert_eq!(pipe.write(b"").await, Ok(0));

    let mut writer = PipeWriter::new(pipe.clone());
    let blocked = tokio::time::timeout(Duration::from_millis(50), writer.write_all(&[7u8; 1024])).await;
    assert!(blocked.is_err(), "a full pipe must not accept more bytes");
    assert_eq!(pipe.buffered(), 8);

    let filler = {
      let mut writer = PipeWriter::new(pipe.clone());
      tokio::spawn(async move { writer.write_all(b"abcdefghijkl").await })
    };
    let mut got = Vec::new();
    while got.len() < 20 {
      got.extend_from_slice(&pipe.read(3).await.unwrap());
      assert!(pipe.buffered() <= 8);
    }
    filler.await.unwrap().unwrap();
    assert_eq!(&got[..8], b"01234567");
    assert_eq!(&got[8..], b"abcdefghijkl");
  }

  #[tokio::test]
  async fn close_releases_a_parked_writer() {
    let pipe = BytePipe::with_capacity(4);
    pipe.write(b"full").await.unwrap();
    let parked = {
      let pipe = pipe.clone();
      tokio::spawn(async move { pipe.write(b"more").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    pipe.close();
    assert_eq!(parked.await.unwrap(), Err(PipeError::Closed));
    assert_eq!(pipe.read(16).await.as_deref(), Some(&b"full"[..]));
    assert_eq!(pipe.read(16).await, None);
  }
}
