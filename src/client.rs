/// HTTP chat transport.
///
/// POSTs `{ "messages": [...] }` to the configured endpoint and reads back a
/// server-sent-event UI message stream: one `data: {json}` line per part,
/// terminated by `data: [DONE]`. Parts we act on:
///
///   text-delta             → assistant text
///   tool-input-available   → a tool call the assistant wants to run
///   tool-approval-request  → that tool call needs a user decision
///   error                  → request failed
///   finish                 → end of the reply
///
/// Everything else (start, text-start, step markers, ...) is ignored.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;

use crate::message::{Approval, Message, Role, ToolCall};
use crate::transport::{ChatRequest, ChatSink, ChatTransport};

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum WirePart {
    TextDelta {
        delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolApprovalRequest {
        tool_call_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
    },
    Finish,
    #[serde(other)]
    Other,
}

/// One decoded stream part.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPart {
    TextDelta(String),
    ToolInput { id: String, name: String, input: Value },
    ApprovalRequest { tool_call_id: String },
    Error(String),
    Finish,
    Done,
}

/// Decode a single SSE line. `None` for blank lines, comments, non-data
/// fields and part types we do not act on.
pub fn parse_sse_line(line: &str) -> Option<StreamPart> {
    let line = line.trim();
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(StreamPart::Done);
    }
    match serde_json::from_str::<WirePart>(data) {
        Ok(WirePart::TextDelta { delta }) => Some(StreamPart::TextDelta(delta)),
        Ok(WirePart::ToolInputAvailable { tool_call_id, tool_name, input }) => {
            Some(StreamPart::ToolInput { id: tool_call_id, name: tool_name, input })
        }
        Ok(WirePart::ToolApprovalRequest { tool_call_id }) => {
            Some(StreamPart::ApprovalRequest { tool_call_id })
        }
        Ok(WirePart::Error { error_text }) => Some(StreamPart::Error(error_text)),
        Ok(WirePart::Finish) => Some(StreamPart::Finish),
        Ok(WirePart::Other) => None,
        Err(e) => {
            tracing::debug!("skipping undecodable stream part: {e}");
            None
        }
    }
}

/// Splits a byte stream into SSE lines. Chunks may end mid-line or even
/// mid-UTF-8 sequence; the tail is carried to the next `push`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    leftover: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamPart> {
        self.leftover.extend_from_slice(chunk);
        let mut parts = Vec::new();
        while let Some(pos) = self.leftover.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.leftover.drain(..=pos).collect();
            if let Some(part) = parse_sse_line(&String::from_utf8_lossy(&line)) {
                parts.push(part);
            }
        }
        parts
    }

    /// Whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<StreamPart> {
        let rest = std::mem::take(&mut self.leftover);
        parse_sse_line(&String::from_utf8_lossy(&rest))
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct HttpChatTransport {
    http: reqwest::Client,
    pub endpoint: String,
    api_key: Option<String>,
}

impl HttpChatTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: None,
        }
    }

    pub fn set_api_key(&mut self, key: String) {
        self.api_key = Some(key);
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn stream(&self, request: ChatRequest, sink: ChatSink) -> Result<()> {
        let body = serde_json::json!({
            "id": format!("cmdk-{}", request.id),
            "messages": build_messages(&request.messages),
        });

        let mut req = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);

        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("chat endpoint error {}: {}", status, text));
        }

        let mut stream = resp.bytes_stream();
        let mut decoder = SseDecoder::default();
        // Tool calls seen so far, so an approval request can re-emit the full call
        let mut calls: Vec<ToolCall> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.context("reading chat stream")?;
            for part in decoder.push(&bytes) {
                if !apply_part(part, &sink, &mut calls)? {
                    return Ok(());
                }
            }
        }
        if let Some(part) = decoder.finish() {
            apply_part(part, &sink, &mut calls)?;
        }
        Ok(())
    }
}

/// Forward one part to the sink. `Ok(false)` means the stream is complete.
fn apply_part(part: StreamPart, sink: &ChatSink, calls: &mut Vec<ToolCall>) -> Result<bool> {
    match part {
        StreamPart::TextDelta(text) => {
            if !sink.delta(text) {
                // Nobody is listening any more.
                return Ok(false);
            }
        }
        StreamPart::ToolInput { id, name, input } => {
            let call = ToolCall { id, name, input, approval: Approval::NotRequired };
            calls.retain(|c| c.id != call.id);
            calls.push(call.clone());
            sink.tool_call(call);
        }
        StreamPart::ApprovalRequest { tool_call_id } => {
            let call = match calls.iter_mut().find(|c| c.id == tool_call_id) {
                Some(call) => {
                    call.approval = Approval::Pending;
                    call.clone()
                }
                None => ToolCall {
                    id: tool_call_id,
                    name: String::new(),
                    input: Value::Null,
                    approval: Approval::Pending,
                },
            };
            sink.tool_call(call);
        }
        StreamPart::Error(text) => return Err(anyhow!(text)),
        StreamPart::Finish | StreamPart::Done => return Ok(false),
    }
    Ok(true)
}

// ── Build the messages array for the endpoint ─────────────────────────────────

fn build_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .filter(|m| !m.is_error() || !m.content.is_empty())
        .map(|msg| {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let mut parts = Vec::new();
            if !msg.content.is_empty() {
                parts.push(serde_json::json!({ "type": "text", "text": msg.content }));
            }
            for call in &msg.tool_calls {
                parts.push(tool_part(call));
            }
            serde_json::json!({ "id": msg.id, "role": role, "parts": parts })
        })
        .collect()
}

fn tool_part(call: &ToolCall) -> Value {
    let mut part = serde_json::json!({
        "type": format!("tool-{}", call.name),
        "toolCallId": call.id,
        "input": call.input,
    });
    match call.approval {
        Approval::NotRequired => {
            part["state"] = "input-available".into();
        }
        Approval::Pending => {
            part["state"] = "approval-requested".into();
            part["approval"] = serde_json::json!({ "id": call.id });
        }
        Approval::Approved | Approval::Rejected => {
            part["state"] = "approval-responded".into();
            part["approval"] = serde_json::json!({
                "id": call.id,
                "approved": call.approval == Approval::Approved,
            });
        }
    }
    part
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_known_parts() {
        assert_eq!(
            parse_sse_line(r#"data: {"type":"text-delta","id":"t0","delta":"Hel"}"#),
            Some(StreamPart::TextDelta("Hel".into()))
        );
        assert_eq!(parse_sse_line("data: [DONE]"), Some(StreamPart::Done));
        assert_eq!(
            parse_sse_line(r#"data: {"type":"error","errorText":"rate limited"}"#),
            Some(StreamPart::Error("rate limited".into()))
        );
        assert_eq!(parse_sse_line(r#"data: {"type":"finish"}"#), Some(StreamPart::Finish));
        match parse_sse_line(
            r#"data: {"type":"tool-input-available","toolCallId":"c1","toolName":"deleteFile","input":{"path":"a.txt"}}"#,
        ) {
            Some(StreamPart::ToolInput { id, name, input }) => {
                assert_eq!(id, "c1");
                assert_eq!(name, "deleteFile");
                assert_eq!(input["path"], "a.txt");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_ignores_noise() {
        assert_eq!(parse_sse_line(""), None);
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line(r#"data: {"type":"start"}"#), None);
        assert_eq!(parse_sse_line(r#"data: {"type":"text-start","id":"t0"}"#), None);
        assert_eq!(parse_sse_line("data: {truncated"), None);
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        let line = "data: {\"type\":\"text-delta\",\"id\":\"t\",\"delta\":\"héllo\"}\n\n";
        let bytes = line.as_bytes();
        // Split inside the multi-byte 'é'
        let split = line.find('é').unwrap() + 1;
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(
            decoder.push(&bytes[split..]),
            vec![StreamPart::TextDelta("héllo".into())]
        );
        assert_eq!(decoder.push(b"data: [DONE]"), vec![]);
        assert_eq!(decoder.finish(), Some(StreamPart::Done));
    }

    #[test]
    fn test_approval_request_reemits_pending_call() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ChatSink::new(3, tx);
        let mut calls = Vec::new();
        assert!(apply_part(
            StreamPart::ToolInput { id: "c1".into(), name: "rm".into(), input: Value::Null },
            &sink,
            &mut calls
        )
        .unwrap());
        assert!(apply_part(StreamPart::ApprovalRequest { tool_call_id: "c1".into() }, &sink, &mut calls).unwrap());
        assert!(!apply_part(StreamPart::Finish, &sink, &mut calls).unwrap());
        assert!(apply_part(StreamPart::Error("bad".into()), &sink, &mut calls).is_err());

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        match (first, second) {
            (
                crate::transport::ChatEvent::ToolCall { call: a, .. },
                crate::transport::ChatEvent::ToolCall { call: b, .. },
            ) => {
                assert_eq!(a.approval, Approval::NotRequired);
                assert_eq!(b.approval, Approval::Pending);
                assert_eq!(b.name, "rm");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_build_messages_carries_approval_decisions() {
        let mut assistant = Message::assistant("");
        assistant.tool_calls.push(ToolCall {
            id: "c1".into(),
            name: "deleteFile".into(),
            input: serde_json::json!({"path": "a"}),
            approval: Approval::Approved,
        });
        let wire = build_messages(&[Message::user("delete a"), assistant]);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["parts"][0]["text"], "delete a");
        let part = &wire[1]["parts"][0];
        assert_eq!(part["type"], "tool-deleteFile");
        assert_eq!(part["state"], "approval-responded");
        assert_eq!(part["approval"]["approved"], true);
    }
}
