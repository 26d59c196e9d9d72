//! Post-response hooks.
//!
//! [`on_response_complete`] wraps a response body so a callback runs once the
//! body has been fully handed to the connection, or once it is dropped
//! (client went away, empty body never polled). Exactly one of the two fires
//! the hook.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};

type Hook = Box<dyn FnOnce() + Send + 'static>;

/// Run `hook` after `response` has been sent.
pub fn on_response_complete<F>(response: Response, hook: F) -> Response
where
    F: FnOnce() + Send + 'static,
{
    let (parts, body) = response.into_parts();
    let body = CompletionBody {
        inner: body,
        hook: Some(Box::new(hook)),
    };
    Response::from_parts(parts, Body::new(body))
}

struct CompletionBody {
    inner: Body,
    hook: Option<Hook>,
}

impl CompletionBody {
    fn fire(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook();
        }
    }
}

impl HttpBody for CompletionBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(None) = polled {
            this.fire();
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
        self.fire();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::response::IntoResponse;
    use http_body_util::BodyExt;

    use super::*;

    fn counting_hook(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn hook_runs_once_after_body_is_consumed() {
        let fired = Arc::new(AtomicUsize::new(0));
        let response = on_response_complete("hello".into_response(), counting_hook(&fired));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hook_runs_when_body_is_dropped_unread() {
        let fired = Arc::new(AtomicUsize::new(0));
        let response = on_response_complete("unread".into_response(), counting_hook(&fired));
        drop(response);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn status_and_headers_are_preserved() {
        let fired = Arc::new(AtomicUsize::new(0));
        let original = (axum::http::StatusCode::CREATED, [("x-test", "1")], "made").into_response();
        let response = on_response_complete(original, counting_hook(&fired));
        assert_eq!(response.status(), axum::http::StatusCode::CREATED);
        assert_eq!(response.headers()["x-test"], "1");
    }
}
