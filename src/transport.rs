/// Chat transport seam.
///
/// Data flow:
///   controller:  builds a `ChatRequest` and calls `dispatch`
///   transport:   spawned task, pushes `ChatEvent`s through a `ChatSink`
///   host loop:   drains the receiver and feeds each event back into the controller
///
/// Transports only ever emit content events; the dispatcher appends the
/// single terminal `Finished` / `Failed` once `stream` returns, so a
/// transport cannot forget to close its request.
use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::client::HttpChatTransport;
use crate::message::{Message, ToolCall};

/// Monotonic per-controller request counter.
pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub id: RequestId,
    /// Full ordered history, including the message just sent
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A streamed chunk of assistant text
    Delta { request: RequestId, text: String },
    /// The assistant proposed a tool call (possibly awaiting approval)
    ToolCall { request: RequestId, call: ToolCall },
    Finished { request: RequestId },
    Failed { request: RequestId, error: String },
}

impl ChatEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            ChatEvent::Delta { request, .. }
            | ChatEvent::ToolCall { request, .. }
            | ChatEvent::Finished { request }
            | ChatEvent::Failed { request, .. } => *request,
        }
    }
}

/// Where a transport pushes its output for one request.
#[derive(Debug, Clone)]
pub struct ChatSink {
    request: RequestId,
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl ChatSink {
    pub fn new(request: RequestId, tx: mpsc::UnboundedSender<ChatEvent>) -> Self {
        Self { request, tx }
    }

    pub fn request_id(&self) -> RequestId {
        self.request
    }

    /// Returns false once the receiving side is gone; transports may stop early.
    pub fn delta(&self, text: impl Into<String>) -> bool {
        self.tx
            .send(ChatEvent::Delta { request: self.request, text: text.into() })
            .is_ok()
    }

    pub fn tool_call(&self, call: ToolCall) -> bool {
        self.tx
            .send(ChatEvent::ToolCall { request: self.request, call })
            .is_ok()
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Stream the assistant's reply to `request` into `sink`. Returning
    /// `Err` marks the request failed; partial output already sent is kept.
    async fn stream(&self, request: ChatRequest, sink: ChatSink) -> Result<()>;
}

/// How the palette reaches a chat model.
#[derive(Clone)]
pub enum ChatBackend {
    /// HTTP endpoint speaking the UI-message SSE stream
    Endpoint { url: String, api_key: Option<String> },
    /// An in-process provider supplied by the host
    External(Arc<dyn ChatTransport>),
}

impl std::fmt::Debug for ChatBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatBackend::Endpoint { url, .. } => f.debug_tuple("Endpoint").field(url).finish(),
            ChatBackend::External(_) => f.write_str("External"),
        }
    }
}

impl ChatBackend {
    pub fn endpoint(url: impl Into<String>) -> Self {
        ChatBackend::Endpoint { url: url.into(), api_key: None }
    }

    pub fn into_transport(self) -> Arc<dyn ChatTransport> {
        match self {
            ChatBackend::Endpoint { url, api_key } => {
                let mut http = HttpChatTransport::new(url);
                if let Some(key) = api_key {
                    http.set_api_key(key);
                }
                Arc::new(http)
            }
            ChatBackend::External(transport) => transport,
        }
    }
}

/// Spawn `transport.stream(request)` on `handle`, then send the terminal event.
/// A panicking transport is reported as a failed request.
pub fn dispatch(
    handle: &tokio::runtime::Handle,
    transport: Arc<dyn ChatTransport>,
    request: ChatRequest,
    tx: mpsc::UnboundedSender<ChatEvent>,
) -> tokio::task::JoinHandle<()> {
    handle.spawn(async move {
        let id = request.id;
        let sink = ChatSink::new(id, tx.clone());
        let result = AssertUnwindSafe(transport.stream(request, sink)).catch_unwind().await;
        let terminal = match result {
            Ok(Ok(())) => ChatEvent::Finished { request: id },
            Ok(Err(e)) => {
                tracing::warn!(request = id, "chat transport failed: {e:#}");
                ChatEvent::Failed { request: id, error: format!("{e:#}") }
            }
            Err(_) => {
                tracing::error!(request = id, "chat transport panicked");
                ChatEvent::Failed { request: id, error: "chat transport panicked".to_string() }
            }
        };
        let _ = tx.send(terminal);
    })
}
