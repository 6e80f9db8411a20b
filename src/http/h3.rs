//! HTTP/3 request bridging.
//!
//! # Responsibilities
//! - Drive one h3 connection per accepted QUIC connection
//! - Feed every request stream through the same per-listener router the
//!   TCP stacks use, so counters, CORS and context paths behave identically
//! - Forward response frames one DATA frame at a time; quinn hands each
//!   frame to the transport immediately, which is the flush the periodic
//!   probe depends on
//!
//! # Design Decisions
//! - Each request stream runs in its own task and is joined before the
//!   connection is reported finished
//! - Peer-initiated teardown (H3_NO_ERROR, cancelled requests) is the
//!   normal end of a saturation test and stays out of the logs

use axum::body::Body;
use axum::Router;
use bytes::{Buf, Bytes};
use h3::error::{Code, ErrorLevel};
use h3::server::RequestStream;
use http::{Method, Request, Response};
use http_body_util::BodyExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::ServiceExt;

use crate::net::is_disconnect;

/// Serves every request stream arriving on one QUIC connection.
///
/// Returns when the peer closes the connection, the connection errors out,
/// or `shutdown` flips. In-flight request tasks are joined before
/// returning, so no stream outlives its connection.
pub async fn serve_connection(
    connection: quinn::Connection,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), h3::Error> {
    let mut conn = h3::server::Connection::new(h3_quinn::Connection::new(connection)).await?;
    let mut requests = JoinSet::new();

    let result = loop {
        tokio::select! {
            accepted = conn.accept() => match accepted {
                Ok(Some((request, stream))) => {
                    let router = router.clone();
                    let _ = requests.spawn(async move {
                        if let Err(err) = handle_request(request, stream, router).await {
                            log_stream_end(&err);
                        }
                    });
                }
                Ok(None) => break Ok(()),
                Err(err) => match err.get_error_level() {
                    ErrorLevel::ConnectionError => break Err(err),
                    ErrorLevel::StreamError => {
                        tracing::debug!(error = %err, "h3 request stream failed to open");
                        continue;
                    }
                },
            },
            _ = shutdown.changed() => break Ok(()),
        }
    };

    // In-flight responses belong to this connection; wait for them before
    // letting the endpoint close.
    while requests.join_next().await.is_some() {}
    result
}

async fn handle_request(
    request: Request<()>,
    stream: RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    router: Router,
) -> Result<(), h3::Error> {
    // hyper suppresses HEAD bodies on the TCP stacks; here it is manual.
    let head_only = request.method() == Method::HEAD;
    let (mut send, recv) = stream.split();

    let request = request.map(|()| request_body(recv));
    let response = match router.oneshot(request).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    };

    let (parts, mut body) = response.into_parts();
    send.send_response(Response::from_parts(parts, ())).await?;

    if !head_only {
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Ok(data) = frame.into_data() {
                        send.send_data(data).await?;
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "response body failed mid-stream");
                    break;
                }
            }
        }
    }

    send.finish().await
}

/// Adapts the h3 receive half into a request body the router can drain.
fn request_body(recv: RequestStream<h3_quinn::RecvStream, Bytes>) -> Body {
    Body::from_stream(futures_util::stream::try_unfold(
        recv,
        |mut recv| async move {
            match recv.recv_data().await? {
                Some(mut buf) => {
                    let data = buf.copy_to_bytes(buf.remaining());
                    Ok(Some((data, recv)))
                }
                None => Ok::<_, h3::Error>(None),
            }
        },
    ))
}

/// True when the peer ended the stream or connection on purpose: a clean
/// close (H3_NO_ERROR) or a client-side abort (H3_REQUEST_CANCELLED,
/// H3_REQUEST_REJECTED). quinn surfaces an aborted download as a stopped
/// send stream carrying the peer's code.
pub(crate) fn is_peer_close(err: &h3::Error) -> bool {
    let Some(code) = err.try_get_code() else {
        return false;
    };
    code == Code::H3_NO_ERROR
        || code == Code::H3_REQUEST_CANCELLED
        || code == Code::H3_REQUEST_REJECTED
}

fn log_stream_end(err: &h3::Error) {
    if is_peer_close(err) || is_disconnect(err) {
        tracing::trace!("h3 request stream ended by peer");
    } else if err.try_get_code().is_none() {
        // No application code means the connection went away under the
        // stream; the connection loop reports that end itself.
        tracing::debug!(error = %err, "h3 request stream ended with the connection");
    } else {
        tracing::warn!(error = %err, "h3 request stream failed");
    }
}
