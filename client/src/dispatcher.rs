//! Agent-side request handling: replays relay exchanges against the local
//! service and streams the responses back.

use std::sync::Arc;

use backhaul_shared::protocol::AGENT_FAILURE_HEADER;
use backhaul_shared::pump::{self, BodySink, BodyStream, Written};
use backhaul_shared::{
    headers, BodyFrame, Control, FrameHandler, HeaderList, RequestFrame, RequestHeader,
    ResponseFrame, ResponseHeader, TunnelTransport,
};
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use tokio::task::AbortHandle;
use tracing::{debug, warn, Instrument, Span};

use crate::bridge::WsBridge;
use crate::config::LocalTarget;
use crate::liveness::Liveness;

/// A local call in flight.
#[derive(Default)]
struct LocalCall {
    /// Feeds the local request body until its terminal frame.
    body: Option<BodySink>,
    task: Option<AbortHandle>,
}

/// Frame handler of one agent connection.
#[derive(Clone)]
pub struct Dispatcher {
    transport: TunnelTransport<ResponseFrame>,
    http: reqwest::Client,
    target: Arc<LocalTarget>,
    bridge: WsBridge,
    liveness: Liveness,
    calls: Arc<DashMap<String, LocalCall>>,
}

impl Dispatcher {
    pub fn new(
        transport: TunnelTransport<ResponseFrame>,
        http: reqwest::Client,
        target: Arc<LocalTarget>,
        bridge: WsBridge,
        liveness: Liveness,
    ) -> Self {
        Self {
            transport,
            http,
            target,
            bridge,
            liveness,
            calls: Arc::new(DashMap::new()),
        }
    }

    /// Local calls not yet finished.
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    fn on_header(&self, header: RequestHeader) {
        let request_id = header.request_id.clone();

        if headers::is_websocket_upgrade(&header.method, &header.headers) {
            let bridge = self.bridge.clone();
            let transport = self.transport.clone();
            tokio::spawn(
                async move { bridge.open(&transport, header).await }.instrument(Span::current()),
            );
            return;
        }

        let (sink, body) = if header.eof {
            (None, None)
        } else {
            let (sink, body) = pump::body_channel();
            (Some(sink), Some(body))
        };
        self.calls.insert(
            request_id.clone(),
            LocalCall {
                body: sink,
                task: None,
            },
        );

        let this = self.clone();
        let handle = tokio::spawn(
            async move {
                let request_id = header.request_id.clone();
                this.call(header, body).await;
                this.calls.remove(&request_id);
            }
            .instrument(Span::current()),
        );
        // The call may already be over and its record gone.
        if let Some(mut call) = self.calls.get_mut(&request_id) {
            call.task = Some(handle.abort_handle());
        }
    }

    fn on_body(&self, frame: BodyFrame) {
        let request_id = frame.request_id.clone();
        let Some(mut call) = self.calls.get_mut(&request_id) else {
            debug!(request_id = %request_id, "Body frame for finished call (dropped)");
            return;
        };
        let written = match &call.body {
            Some(sink) => sink.write(frame),
            None => {
                debug!(request_id = %request_id, "Body frame after end of request body (dropped)");
                Written::More
            }
        };
        match written {
            // Dropping the sink ends the local request body.
            Written::Finished => call.body = None,
            Written::More => {}
            Written::Overflow => {
                // A failed body fails the local call, which reports 502.
                if let Some(sink) = call.body.take() {
                    sink.fail("request body overflow");
                }
                drop(call);
                self.calls.remove(&request_id);
            }
        }
    }

    fn on_abort(&self, request_id: &str) {
        match self.calls.remove(request_id) {
            Some((_, call)) => {
                debug!(request_id, "Local call aborted by relay");
                if let Some(task) = call.task {
                    task.abort();
                }
            }
            None => debug!(request_id, "Abort for unknown call ignored"),
        }
    }

    /// Run one local call and report it. Local failures become protocol
    /// frames; only a lost tunnel stops the report early.
    async fn call(&self, header: RequestHeader, body: Option<BodyStream>) {
        let request_id = header.request_id.clone();
        let request = match self.build_request(&header, body) {
            Ok(request) => request,
            Err(e) => {
                warn!(request_id = %request_id, "Cannot build local request: {}", e);
                self.reply_bad_gateway(&request_id).await;
                return;
            }
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %request_id, "Local call failed: {}", e);
                self.reply_bad_gateway(&request_id).await;
                return;
            }
        };

        let status = response.status();
        let mut response_headers = header_list(response.headers());
        headers::strip_content_encoding(&mut response_headers);
        headers::strip_hop_by_hop(&mut response_headers);
        headers::remove(&mut response_headers, AGENT_FAILURE_HEADER);
        let eof = has_no_body(&header.method, status, response.content_length());
        debug!(request_id = %request_id, status = status.as_u16(), "Local call answered");

        let frame = ResponseFrame::Header(ResponseHeader {
            request_id: request_id.clone(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: response_headers,
            eof,
        });
        if self.transport.send(frame).await.is_err() {
            return;
        }
        if !eof {
            if let Err(e) = pump::pump_out(&self.transport, &request_id, response.bytes_stream()).await {
                debug!(request_id = %request_id, "Response body cut short: {}", e);
            }
        }
    }

    async fn reply_bad_gateway(&self, request_id: &str) {
        let frame = ResponseFrame::Header(ResponseHeader::bad_gateway(request_id));
        if let Err(e) = self.transport.send(frame).await {
            debug!(request_id, "Failure report not delivered: {}", e);
        }
    }

    fn build_request(
        &self,
        header: &RequestHeader,
        body: Option<BodyStream>,
    ) -> anyhow::Result<reqwest::RequestBuilder> {
        let method = Method::from_bytes(header.method.as_bytes())?;
        let url = self.target.http_url(&header.path)?;

        let mut forwarded = header.headers.clone();
        headers::resynthesize_host(&mut forwarded, self.target.authority());
        headers::strip_hop_by_hop(&mut forwarded);

        let mut map = HeaderMap::new();
        for (k, v) in &forwarded {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                map.append(name, value);
            }
        }

        let mut request = self.http.request(method, url).headers(map);
        if let Some(body) = body {
            request = request.body(reqwest::Body::wrap_stream(body));
        }
        Ok(request)
    }
}

impl FrameHandler for Dispatcher {
    type Inbound = RequestFrame;

    fn on_frame(&self, frame: RequestFrame) {
        match frame {
            RequestFrame::Header(header) => self.on_header(header),
            RequestFrame::Body(body) => self.on_body(body),
            RequestFrame::Abort(abort) => self.on_abort(&abort.request_id),
        }
    }

    fn on_control(&self, control: Control) {
        if control == Control::Pong {
            self.liveness.on_pong();
        }
    }

    fn on_close(&self) {
        let ids: Vec<String> = self.calls.iter().map(|e| e.key().clone()).collect();
        for request_id in &ids {
            if let Some((_, call)) = self.calls.remove(request_id) {
                if let Some(sink) = call.body {
                    sink.fail("tunnel connection lost");
                }
                if let Some(task) = call.task {
                    task.abort();
                }
            }
        }
        if !ids.is_empty() {
            warn!(calls = ids.len(), "Tunnel closed, local calls cancelled");
        }
    }
}

fn header_list(map: &HeaderMap) -> HeaderList {
    map.iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
        .collect()
}

/// Responses that cannot carry a body.
fn has_no_body(method: &str, status: StatusCode, content_length: Option<u64>) -> bool {
    method.eq_ignore_ascii_case("HEAD")
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || content_length == Some(0)
}
