//! Streaming relay of upstream responses
//!
//! A relayed response moves through `Idle -> HeadersSent -> BodyStreaming -> Done | Aborted`.
//! The status line and headers are committed exactly once when the response is handed to the
//! server; after that, a body failure can only terminate the transfer, never turn into an error
//! response.

use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::Response;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Nothing sent yet
    Idle,
    /// Status and headers committed
    HeadersSent,
    /// At least one body frame passed through
    BodyStreaming,
    /// Upstream body ended cleanly
    Done,
    /// Transfer terminated early
    Aborted,
}

impl RelayState {
    pub fn can_transition_to(self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (Idle, HeadersSent)
                | (HeadersSent, BodyStreaming)
                | (HeadersSent, Done)
                | (HeadersSent, Aborted)
                | (BodyStreaming, BodyStreaming)
                | (BodyStreaming, Done)
                | (BodyStreaming, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RelayState::Done | RelayState::Aborted)
    }
}

/// Request identity carried into relay log lines
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub request_id: String,
    pub host: String,
    pub upstream: String,
    started: Instant,
}

impl RelayContext {
    pub fn new(request_id: impl Into<String>, host: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            host: host.into(),
            upstream: upstream.into(),
            started: Instant::now(),
        }
    }
}

/// Upstream body wrapper that tracks relay state as frames pass through
pub struct RelayBody<B> {
    inner: Pin<Box<B>>,
    state: RelayState,
    bytes: u64,
    /// Upstream reported end of stream when the head was committed
    empty: bool,
    context: RelayContext,
}

impl<B> RelayBody<B> {
    pub fn new(inner: B, context: RelayContext) -> Self {
        Self {
            inner: Box::pin(inner),
            state: RelayState::Idle,
            bytes: 0,
            empty: false,
            context,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Body bytes relayed so far
    pub fn bytes_relayed(&self) -> u64 {
        self.bytes
    }

    fn advance(&mut self, next: RelayState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    fn finish(&mut self) {
        if self.advance(RelayState::Done) {
            debug!(
                request_id = %self.context.request_id,
                host = %self.context.host,
                upstream = %self.context.upstream,
                bytes = self.bytes,
                elapsed_ms = self.context.started.elapsed().as_millis() as u64,
                "Response relayed"
            );
        }
    }

    fn abort(&mut self, reason: &dyn fmt::Display) {
        if self.advance(RelayState::Aborted) {
            warn!(
                request_id = %self.context.request_id,
                host = %self.context.host,
                upstream = %self.context.upstream,
                bytes = self.bytes,
                reason = %reason,
                "Response relay aborted mid-stream"
            );
        }
    }
}

impl<B: Body> RelayBody<B> {
    fn commit_head(&mut self) {
        if self.advance(RelayState::HeadersSent) {
            self.empty = self.inner.is_end_stream();
        }
    }
}

impl<B> Body for RelayBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        match this.inner.as_mut().poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
                this.advance(RelayState::BodyStreaming);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.abort(&e);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for RelayBody<B> {
    fn drop(&mut self) {
        if self.state.is_terminal() || self.state == RelayState::Idle {
            return;
        }
        // hyper may skip polling a body that reports end of stream up front
        if self.state == RelayState::HeadersSent && self.empty {
            self.finish();
        } else {
            self.abort(&"client went away");
        }
    }
}

/// Relay an upstream response: status and every header verbatim, body streamed
pub fn relay_response<B>(
    upstream: Response<B>,
    context: RelayContext,
) -> Response<BoxBody<Bytes, hyper::Error>>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
{
    let (parts, body) = upstream.into_parts();

    let mut body = RelayBody::new(body, context);
    body.commit_head();

    Response::from_parts(parts, body.boxed())
}
