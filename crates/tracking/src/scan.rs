//! QR decode sources.
//!
//! A live camera stream and an uploaded still image both reduce to
//! [`QrDecode::decode`], so boarding never branches on where the code came
//! from.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use realtime::{Error, Result, Subscription, SymbolReader, VehicleCode};
use tracing::debug;

/// A source that yields the text of one QR code.
#[async_trait]
pub trait QrDecode: Send {
    /// Decoded text of the first readable code.
    async fn decode(&mut self) -> Result<String>;
}

/// One uploaded image.
pub struct StillImage<R> {
    reader: Arc<R>,
    image: Bytes,
}

impl<R: SymbolReader> StillImage<R> {
    pub const fn new(reader: Arc<R>, image: Bytes) -> Self {
        Self { reader, image }
    }
}

#[async_trait]
impl<R: SymbolReader + 'static> QrDecode for StillImage<R> {
    async fn decode(&mut self) -> Result<String> {
        self.reader.read(&self.image).map_err(|e| {
            debug!(error = %e, "no symbol in image");
            Error::Decode("could not read a QR code from the image".into())
        })
    }
}

/// Live camera frames, scanned until one of them decodes.
pub struct CameraStream<R> {
    reader: Arc<R>,
    frames: Subscription<Bytes>,
}

impl<R: SymbolReader> CameraStream<R> {
    pub const fn new(reader: Arc<R>, frames: Subscription<Bytes>) -> Self {
        Self { reader, frames }
    }
}

#[async_trait]
impl<R: SymbolReader + 'static> QrDecode for CameraStream<R> {
    async fn decode(&mut self) -> Result<String> {
        while let Some(frame) = self.frames.next().await {
            // a camera failure ends the scan, an unreadable frame does not
            match self.reader.read(&frame?) {
                Ok(text) => return Ok(text),
                Err(e) => debug!(error = %e, "frame skipped"),
            }
        }
        Err(Error::Decode("camera stopped before a QR code was read".into()))
    }
}

/// Decode a vehicle code from any QR source.
///
/// # Errors
///
/// Returns `Error::Decode` when the source yields no code or the decoded text
/// is blank.
pub async fn decode_vehicle(source: &mut dyn QrDecode) -> Result<VehicleCode> {
    let text = source.decode().await?;
    text.parse().map_err(|e: Error| {
        debug!(error = %e, "decoded text is not a vehicle code");
        Error::Decode("QR code does not name a vehicle".into())
    })
}
