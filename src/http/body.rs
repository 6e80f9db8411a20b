//! Streaming response bodies for the measurement endpoints.
//!
//! # Responsibilities
//! - `ChunkedBody`: saturate the downlink by streaming a fixed filler
//!   buffer until the declared content length is exhausted
//! - `PeriodicBody`: emit one small burst per interval so queueing delay
//!   shows up between bursts instead of being absorbed by buffers
//!
//! # Design Decisions
//! - Bodies own their remaining-byte state, so dropping the connection
//!   drops the transfer and everything it holds
//! - Served bytes are counted when a frame is produced, alongside the
//!   write it turns into
//! - `PeriodicBody` returns `Poll::Pending` between bursts, which is the
//!   point where hyper flushes the previous burst to the socket; the
//!   probe would measure our own buffering otherwise

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};

use crate::counters::ByteCounters;

/// Size of one downlink filler chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on a single periodic burst.
pub const MAX_PERIODIC_SIZE: u64 = 4 * 1024;

/// Pause between periodic bursts.
pub const PERIODIC_INTERVAL: Duration = Duration::from_secs(1);

static CHUNK_BUF: [u8; CHUNK_SIZE] = [b'x'; CHUNK_SIZE];

/// A zero-copy slice of the shared filler buffer.
fn filler(len: usize) -> Bytes {
    Bytes::from_static(&CHUNK_BUF[..len])
}

/// Streams `content_length` filler bytes in full-size chunks, with one
/// final partial chunk for the remainder.
pub struct ChunkedBody {
    remaining: u64,
    counters: Arc<ByteCounters>,
}

impl ChunkedBody {
    pub fn new(content_length: u64, counters: Arc<ByteCounters>) -> Self {
        Self {
            remaining: content_length,
            counters,
        }
    }
}

impl Body for ChunkedBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.remaining == 0 {
            return Poll::Ready(None);
        }

        let len = this.remaining.min(CHUNK_SIZE as u64);
        this.remaining -= len;
        this.counters.add_served(len);
        Poll::Ready(Some(Ok(Frame::data(filler(len as usize)))))
    }

    fn is_end_stream(&self) -> bool {
        self.remaining == 0
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining)
    }
}

/// Emits `burst` filler bytes once per interval until `content_length`
/// is exhausted.
///
/// Each poll waits out the interval first, so the first burst lands one
/// interval after the response starts, matching the probe cadence clients
/// expect.
pub struct PeriodicBody {
    remaining: u64,
    burst: u64,
    sleep: Pin<Box<tokio::time::Sleep>>,
    counters: Arc<ByteCounters>,
}

impl PeriodicBody {
    /// `burst` is clamped to [`MAX_PERIODIC_SIZE`].
    pub fn new(burst: u64, content_length: u64, counters: Arc<ByteCounters>) -> Self {
        Self {
            remaining: content_length,
            burst: burst.min(MAX_PERIODIC_SIZE),
            sleep: Box::pin(tokio::time::sleep(PERIODIC_INTERVAL)),
            counters,
        }
    }
}

impl Body for PeriodicBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.remaining == 0 {
            return Poll::Ready(None);
        }

        ready!(this.sleep.as_mut().poll(cx));
        this.sleep
            .as_mut()
            .reset(tokio::time::Instant::now() + PERIODIC_INTERVAL);

        let len = this.remaining.min(this.burst);
        this.remaining -= len;
        this.counters.add_served(len);
        Poll::Ready(Some(Ok(Frame::data(filler(len as usize)))))
    }

    fn is_end_stream(&self) -> bool {
        self.remaining == 0
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining)
    }
}
