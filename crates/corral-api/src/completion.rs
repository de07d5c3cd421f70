//! Response bodies that report their own delivery.
//!
//! A member that removes itself must not restart before its caller has
//! the answer. Handlers attach a [`Completion`] to such responses; the
//! wrapping [`CompletionBody`] resolves it as [`Delivery::Flushed`] once
//! the last frame has been handed to the connection, or as
//! [`Delivery::Aborted`] if the body is dropped before that.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http_body::{Frame, SizeHint};
use tracing::debug;

use corral_cluster::{Delivery, ResetTicket, SelfRemovalHold};

/// What to release once a response has been delivered.
#[derive(Debug)]
pub enum Completion {
    /// Keeps the restart gate closed until delivery.
    Hold(SelfRemovalHold),
    /// Lets an armed reset proceed after delivery.
    Reset(ResetTicket),
}

impl Completion {
    fn resolve(self, delivery: Delivery) {
        debug!(?delivery, "tracked response finished");
        match self {
            Completion::Hold(hold) => drop(hold),
            Completion::Reset(ticket) => ticket.deliver(delivery),
        }
    }
}

/// Body wrapper that resolves a [`Completion`] when delivery ends.
pub struct CompletionBody {
    inner: Body,
    completion: Option<Completion>,
}

impl CompletionBody {
    pub fn new(inner: Body, completion: Completion) -> Self {
        Self {
            inner,
            completion: Some(completion),
        }
    }

    fn finish(&mut self, delivery: Delivery) {
        if let Some(completion) = self.completion.take() {
            completion.resolve(delivery);
        }
    }
}

impl http_body::Body for CompletionBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.finish(Delivery::Flushed),
            Poll::Ready(Some(Err(_))) => this.finish(Delivery::Aborted),
            // The transport may stop polling once the length is satisfied.
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => this.finish(Delivery::Flushed),
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CompletionBody {
    fn drop(&mut self) {
        self.finish(Delivery::Aborted);
    }
}

/// Attach `completion` to `response`.
pub fn tracked(response: Response, completion: Completion) -> Response {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, Body::new(CompletionBody::new(body, completion)))
}
