use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, bounded};

use crate::context::Direction;
use crate::error::{Error, Result};
use crate::ring::Enqueued;

/// Completion callback of a queued request.
pub(crate) type Reply<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// A cipher or AEAD request.
///
/// The source is `assoclen` bytes of associated data followed by the
/// payload; on decrypt the payload ends with the tag. It may be split
/// across any number of fragments.
#[derive(Debug, Clone)]
pub struct CipherRequest {
    pub direction: Direction,
    pub src: Vec<Bytes>,
    pub assoclen: usize,
    /// Payload bytes after the associated data. Defaults to the rest of
    /// the source.
    pub cryptlen: Option<usize>,
    pub iv: Vec<u8>,
}

impl CipherRequest {
    pub fn new(direction: Direction, iv: &[u8], src: impl Into<Bytes>) -> Self {
        Self {
            direction,
            src: vec![src.into()],
            assoclen: 0,
            cryptlen: None,
            iv: iv.to_vec(),
        }
    }

    pub fn encrypt(iv: &[u8], src: impl Into<Bytes>) -> Self {
        Self::new(Direction::Encrypt, iv, src)
    }

    pub fn decrypt(iv: &[u8], src: impl Into<Bytes>) -> Self {
        Self::new(Direction::Decrypt, iv, src)
    }

    /// Replace the source with several fragments.
    pub fn fragments(mut self, src: Vec<Bytes>) -> Self {
        self.src = src;
        self
    }

    pub fn assoclen(mut self, n: usize) -> Self {
        self.assoclen = n;
        self
    }

    pub fn cryptlen(mut self, n: usize) -> Self {
        self.cryptlen = Some(n);
        self
    }

    pub(crate) fn src_len(&self) -> usize {
        self.src.iter().map(Bytes::len).sum()
    }
}

/// Result of a cipher request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherOutput {
    /// Associated data followed by the processed payload (and tag, on
    /// encrypt).
    pub data: Vec<u8>,
    /// Chaining IV for the next request, for CBC.
    pub next_iv: Option<Vec<u8>>,
}

/// Handle to the eventual result of a queued request.
#[derive(Debug)]
pub struct Ticket<T> {
    rx: Receiver<Result<T>>,
    enqueued: Enqueued,
}

impl<T: Send + 'static> Ticket<T> {
    /// The callback that completes a ticket, and the ticket's receiver.
    pub(crate) fn channel() -> (Reply<T>, Receiver<Result<T>>) {
        let (tx, rx) = bounded(1);
        let reply: Reply<T> = Box::new(move |res| {
            // The ticket may have been dropped.
            let _ = tx.send(res);
        });
        (reply, rx)
    }

    pub(crate) fn new(rx: Receiver<Result<T>>, enqueued: Enqueued) -> Self {
        Self { rx, enqueued }
    }

    /// An already completed ticket.
    pub(crate) fn ready(res: Result<T>) -> Self {
        let (reply, rx) = Self::channel();
        reply(res);
        Self::new(rx, Enqueued::Queued)
    }
}

impl<T> Ticket<T> {
    /// How the request was queued.
    pub fn enqueued(&self) -> Enqueued {
        self.enqueued
    }

    /// Block until the request completes.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(Error::Shutdown))
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Shutdown),
        }
    }

    /// The result, if the request has completed.
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(res) => Some(res),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::Shutdown)),
        }
    }
}
