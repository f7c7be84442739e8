//! Upstream SSE driver: connects to the provider and pumps the four
//! listener callbacks ([`on_open`], [`on_event`], [`on_closed`],
//! [`on_failure`]) in delivery order.
//!
//! [`on_open`]: crate::relay::UpstreamListener::on_open
//! [`on_event`]: crate::relay::UpstreamListener::on_event
//! [`on_closed`]: crate::relay::UpstreamListener::on_closed
//! [`on_failure`]: crate::relay::UpstreamListener::on_failure

use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::HttpCfg;
use crate::error::{CoreResult, RelayError};
use crate::event::UpstreamEvent;
use crate::relay::{FailureResponse, UpstreamListener, UpstreamSource};

/// Cancellable handle passed to `on_failure`. Once cancelled, the driver
/// dispatches no further events.
#[derive(Debug, Default)]
pub struct SseHandle {
    cancelled: AtomicBool,
}

impl SseHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl UpstreamSource for SseHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Failure response with the body captured up front, so the listener's
/// best-effort `read_body` stays synchronous.
struct BufferedFailureResponse {
    status: u16,
    body: Option<CoreResult<String>>,
}

impl FailureResponse for BufferedFailureResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn read_body(&mut self) -> CoreResult<String> {
        self.body.take().unwrap_or_else(|| {
            Err(RelayError::UpstreamResponse {
                status: self.status,
                message: "response body already consumed".into(),
            })
        })
    }
}

/// Minimal OpenAI-style streaming completion request body.
#[derive(Debug, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl CompletionRequest {
    /// Single-user-message streaming request.
    pub fn user(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![PromptMessage {
                role: "user".into(),
                content: content.into(),
            }],
            stream: true,
        }
    }
}

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(std::time::Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(std::time::Duration::from_millis(cfg.request_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: "airelay/0.1".to_string(),
        })
    }

    /// POST a JSON payload and relay the SSE response through `listener`.
    ///
    /// Connection-level and status-level failures are reported via
    /// `on_failure` (the listener owns client-facing error reporting), so
    /// this returns `Ok(())` for them. A listener error from `on_event` /
    /// `on_closed` propagates to the caller.
    pub async fn post_sse<T: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &T,
        headers: &[(&str, &str)],
        listener: &dyn UpstreamListener,
    ) -> CoreResult<()> {
        use futures_util::StreamExt;

        let mut req = self
            .inner
            .post(url)
            .json(payload)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let handle = SseHandle::default();

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                let err = RelayError::UpstreamConnect(e.to_string());
                listener.on_failure(&handle, &err, None);
                return Ok(());
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.map_err(|e| RelayError::UpstreamResponse {
                status: status.as_u16(),
                message: format!("body read failed: {e}"),
            });
            let mut failure = BufferedFailureResponse {
                status: status.as_u16(),
                body: Some(body),
            };
            let err = RelayError::UpstreamResponse {
                status: status.as_u16(),
                message: "streaming request rejected".into(),
            };
            listener.on_failure(&handle, &err, Some(&mut failure));
            return Ok(());
        }

        listener.on_open();

        let mut frames = SseFrameStream::new(Box::pin(resp.bytes_stream()));
        while let Some(item) = frames.next().await {
            if handle.is_cancelled() {
                debug!("upstream source cancelled, stopping delivery");
                return Ok(());
            }
            match item {
                Ok(ev) => {
                    listener.on_event(ev.id.as_deref(), ev.event.as_deref(), &ev.data)?;
                }
                Err(e) => {
                    warn!("upstream stream broke mid-flight: {e}");
                    listener.on_failure(&handle, &e, None);
                    return Ok(());
                }
            }
        }

        if !handle.is_cancelled() {
            listener.on_closed()?;
        }
        Ok(())
    }
}

/// Parses an SSE byte stream into [`UpstreamEvent`]s.
///
/// Field handling: `id:` and `event:` overwrite, `data:` lines accumulate
/// and join with `\n`, comment lines (leading `:`) and unknown fields are
/// ignored, a blank line dispatches. A partial event at end-of-stream is
/// dispatched if it carried any data.
struct SseFrameStream {
    inner: std::pin::Pin<
        Box<dyn futures_util::stream::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
    >,
    buf: String,
    id: Option<String>,
    event: Option<String>,
    data_lines: Vec<String>,
    flushed_tail: bool,
}

impl SseFrameStream {
    fn new(
        inner: std::pin::Pin<
            Box<
                dyn futures_util::stream::Stream<Item = Result<bytes::Bytes, reqwest::Error>>
                    + Send,
            >,
        >,
    ) -> Self {
        Self {
            inner,
            buf: String::new(),
            id: None,
            event: None,
            data_lines: Vec::new(),
            flushed_tail: false,
        }
    }

    fn take_pending(&mut self) -> Option<UpstreamEvent> {
        if self.data_lines.is_empty() {
            self.id = None;
            self.event = None;
            return None;
        }
        Some(UpstreamEvent {
            id: self.id.take(),
            event: self.event.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }

    /// Returns an event when `line` is the blank dispatch line and data was
    /// accumulated.
    fn feed_line(&mut self, line: &str) -> Option<UpstreamEvent> {
        if line.is_empty() {
            return self.take_pending();
        }
        if line.starts_with(':') {
            return None; // comment / keep-alive
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            // "retry" and anything else: not our concern on the way in
            _ => {}
        }
        None
    }
}

impl futures_util::stream::Stream for SseFrameStream {
    type Item = CoreResult<UpstreamEvent>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;
        loop {
            // Drain complete lines already buffered before polling for more.
            while let Some(idx) = self.buf.find('\n') {
                let mut line = self.buf.drain(..=idx).collect::<String>();
                if line.ends_with('\n') {
                    if line.ends_with("\r\n") {
                        line.truncate(line.len() - 2);
                    } else {
                        line.truncate(line.len() - 1);
                    }
                }
                if let Some(ev) = self.feed_line(&line) {
                    return Poll::Ready(Some(Ok(ev)));
                }
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let s = String::from_utf8_lossy(&chunk);
                    self.buf.push_str(&s);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(RelayError::UpstreamConnect(format!(
                        "stream read failed: {e}"
                    )))));
                }
                Poll::Ready(None) => {
                    if !self.flushed_tail {
                        self.flushed_tail = true;
                        if !self.buf.is_empty() {
                            let tail = std::mem::take(&mut self.buf);
                            self.feed_line(&tail);
                        }
                        if let Some(ev) = self.take_pending() {
                            return Poll::Ready(Some(Ok(ev)));
                        }
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use httpmock::Method::POST;
    use httpmock::MockServer;

    use crate::config::RelayCfg;
    use crate::emitter::{ChannelEmitter, Emission};
    use crate::event::{FramePayload, OutboundEvent};
    use crate::relay::StreamRelay;

    async fn drain(mut rx: tokio::sync::mpsc::UnboundedReceiver<Emission>) -> (Vec<OutboundEvent>, usize) {
        let mut events = Vec::new();
        let mut completions = 0;
        while let Some(emission) = rx.recv().await {
            match emission {
                Emission::Event(ev) => events.push(ev),
                Emission::Complete => completions += 1,
            }
        }
        (events, completions)
    }

    fn content_of(ev: &OutboundEvent) -> String {
        match &ev.data {
            FramePayload::Message(m) => m.content.clone(),
            FramePayload::Raw(s) => s.clone(),
        }
    }

    #[tokio::test]
    async fn relays_data_frames_then_sentinel() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body("id: 1\ndata: Hello\n\nid: 2\ndata: world\n\ndata: [DONE]\n\n");
        });

        let (emitter, rx) = ChannelEmitter::new();
        let relay = StreamRelay::new(Arc::new(emitter), &RelayCfg::default());
        let client = HttpClient::new_default().unwrap();
        client
            .post_sse(
                &format!("{}/v1/chat/completions", server.base_url()),
                &CompletionRequest::user("gpt-4o", "hi"),
                &[("Authorization", "Bearer test-key")],
                &relay,
            )
            .await
            .unwrap();
        drop(relay);

        let (events, completions) = drain(rx).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].id, "1");
        assert_eq!(content_of(&events[0]), "Hello");
        assert_eq!(content_of(&events[1]), "world");
        assert!(events[2].is_sentinel());
        assert_eq!(completions, 1);
        m.assert();
    }

    #[tokio::test]
    async fn stream_end_without_sentinel_still_terminates() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body("data: partial answer\n\n");
        });

        let (emitter, rx) = ChannelEmitter::new();
        let relay = StreamRelay::new(Arc::new(emitter), &RelayCfg::default());
        let client = HttpClient::new_default().unwrap();
        client
            .post_sse(
                &format!("{}/v1/chat/completions", server.base_url()),
                &CompletionRequest::user("gpt-4o", "hi"),
                &[],
                &relay,
            )
            .await
            .unwrap();
        drop(relay);

        let (events, completions) = drain(rx).await;
        assert_eq!(events.len(), 2);
        assert_eq!(content_of(&events[0]), "partial answer");
        assert!(events[1].is_sentinel());
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn failure_status_relays_body_as_error_frame() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(401).body("invalid api key");
        });

        let (emitter, rx) = ChannelEmitter::new();
        let relay = StreamRelay::new(Arc::new(emitter), &RelayCfg::default());
        let client = HttpClient::new_default().unwrap();
        client
            .post_sse(
                &format!("{}/v1/chat/completions", server.base_url()),
                &CompletionRequest::user("gpt-4o", "hi"),
                &[],
                &relay,
            )
            .await
            .unwrap();
        drop(relay);

        let (events, completions) = drain(rx).await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_error());
        let msg = content_of(&events[0]);
        assert!(msg.contains("401"));
        assert!(msg.contains("invalid api key"));
        assert!(events[1].is_sentinel());
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn connect_failure_relays_help_text() {
        // Port 9 (discard) is typically closed.
        let (emitter, rx) = ChannelEmitter::new();
        let cfg = RelayCfg::default();
        let relay = StreamRelay::new(Arc::new(emitter), &cfg);
        let client = HttpClient::new_default().unwrap();
        client
            .post_sse(
                "http://127.0.0.1:9/v1/chat/completions",
                &CompletionRequest::user("gpt-4o", "hi"),
                &[],
                &relay,
            )
            .await
            .unwrap();
        drop(relay);

        let (events, completions) = drain(rx).await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_error());
        assert!(content_of(&events[0]).contains(cfg.connect_help.as_str()));
        assert!(events[1].is_sentinel());
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn parser_joins_multi_line_data_and_skips_comments() {
        use futures_util::StreamExt;

        let body = ": keep-alive\nid: 3\ndata: first\ndata: second\n\n";
        let chunks: Vec<Result<bytes::Bytes, reqwest::Error>> =
            vec![Ok(bytes::Bytes::from(body))];
        let mut stream = SseFrameStream::new(Box::pin(futures_util::stream::iter(chunks)));

        let ev = stream.next().await.unwrap().unwrap();
        assert_eq!(ev.id.as_deref(), Some("3"));
        assert_eq!(ev.data, "first\nsecond");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn parser_handles_crlf_and_split_chunks() {
        use futures_util::StreamExt;

        let chunks: Vec<Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::from("id: 1\r\nda")),
            Ok(bytes::Bytes::from("ta: He")),
            Ok(bytes::Bytes::from("llo\r\n\r\n")),
        ];
        let mut stream = SseFrameStream::new(Box::pin(futures_util::stream::iter(chunks)));

        let ev = stream.next().await.unwrap().unwrap();
        assert_eq!(ev.id.as_deref(), Some("1"));
        assert_eq!(ev.data, "Hello");
    }

    #[tokio::test]
    async fn parser_flushes_partial_event_at_eof() {
        use futures_util::StreamExt;

        let chunks: Vec<Result<bytes::Bytes, reqwest::Error>> =
            vec![Ok(bytes::Bytes::from("data: tail without blank line\n"))];
        let mut stream = SseFrameStream::new(Box::pin(futures_util::stream::iter(chunks)));

        let ev = stream.next().await.unwrap().unwrap();
        assert_eq!(ev.data, "tail without blank line");
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn handle_cancel_is_sticky() {
        let handle = SseHandle::default();
        assert!(!handle.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn buffered_failure_response_reads_once() {
        let mut resp = BufferedFailureResponse {
            status: 500,
            body: Some(Ok("oops".into())),
        };
        assert_eq!(resp.status(), 500);
        assert_eq!(resp.read_body().unwrap(), "oops");
        assert!(resp.read_body().is_err());
    }
}
