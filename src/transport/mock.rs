//! Scripted in-memory transport used by the test suites.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::frame;
use crate::transport::Transport;

/// One chunk handed back by `read`, after a delay.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub delay: Duration,
    pub data: Bytes,
}

impl Reply {
    /// A complete frame carrying `payload`.
    pub fn frame(payload: &[u8]) -> Self {
        Self::raw(frame::encode(payload))
    }

    /// Raw bytes, possibly a partial or malformed frame.
    pub fn raw(data: impl Into<Bytes>) -> Self {
        Self {
            delay: Duration::ZERO,
            data: data.into(),
        }
    }

    /// Delays delivery.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Reply> + Send>;

/// Transport that answers each written request through a closure.
///
/// The closure sees the decoded request payload and returns the chunks to
/// deliver on subsequent reads. With no chunk pending, `read` never resolves.
pub(crate) struct MockTransport {
    open: bool,
    fail_open: bool,
    responder: Responder,
    pending: VecDeque<Reply>,
    written: Arc<Mutex<Vec<Bytes>>>,
}

impl MockTransport {
    pub fn new(responder: impl FnMut(&[u8]) -> Vec<Reply> + Send + 'static) -> Self {
        Self {
            open: false,
            fail_open: false,
            responder: Box::new(responder),
            pending: VecDeque::new(),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A device that never answers.
    pub fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    /// Makes `open` fail.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Shared log of decoded request payloads.
    pub fn written(&self) -> Arc<Mutex<Vec<Bytes>>> {
        Arc::clone(&self.written)
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.fail_open {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "mock port unavailable",
                )));
            }
            self.open = true;
            Ok(())
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.open = false;
            self.pending.clear();
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
        Box::pin(async move {
            if !self.open {
                return Err(Error::NotConnected);
            }
            let payload = frame::decode(&data)?;
            self.written.lock().unwrap().push(payload.clone());
            let replies = (self.responder)(&payload);
            self.pending.extend(replies);
            Ok(data.len())
        })
    }

    fn read(&mut self) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>> {
        Box::pin(async move {
            let Some(reply) = self.pending.pop_front() else {
                return std::future::pending().await;
            };
            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            Ok(reply.data)
        })
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn endpoint(&self) -> &str {
        "mock"
    }
}
