//! Transport layer for radar device communication.
//!
//! A transport is a raw byte channel. Framing happens above it, in the
//! [`Session`](crate::session::Session). Serial ports are the production
//! transport.

pub mod serial;

#[cfg(test)]
pub(crate) mod mock;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::error::Result;

/// Trait for transport implementations.
pub trait Transport: Send {
    /// Opens the channel.
    fn open(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Closes the channel.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Writes raw bytes, returning how many were written.
    fn write(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>>;

    /// Waits for the next chunk of received bytes. A chunk may hold part of
    /// a frame or several frames.
    fn read(&mut self) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>>;

    /// Returns true if open.
    fn is_open(&self) -> bool;

    /// Human-readable endpoint, used in logs.
    fn endpoint(&self) -> &str;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        (**self).open()
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        (**self).close()
    }

    fn write(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
        (**self).write(data)
    }

    fn read(&mut self) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>> {
        (**self).read()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn endpoint(&self) -> &str {
        (**self).endpoint()
    }
}

pub use serial::{SerialConfig, SerialTransport};
