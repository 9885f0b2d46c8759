//! Wire types and framing for the per-agent hook socket.
//!
//! The runtime invokes `aleph hook <event>` as a subprocess for each wired
//! hook; that forwarder connects to the owning agent's unix socket under
//! `harness/`, ships the hook input across, and prints the returned
//! envelope on stdout. Every message on the socket — and on the runtime's
//! own stdio — is one JSON object per line, which the `WireFrame` trait
//! pins down once for all of them.

use std::io;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use aleph_core::hooks::{HookEventName, HookOutput};
use aleph_core::stream::{InputMessage, StreamMessage};

/// Line-delimited JSON framing for a protocol message.
///
/// A frame is the serialized value plus a trailing newline; whitespace-only
/// lines between frames are skipped, and EOF between frames is a clean
/// close (`Ok(None)`). A line that is not valid JSON for `Self` surfaces as
/// `InvalidData` so the caller can decide whether to drop the peer or just
/// the line.
#[allow(async_fn_in_trait)]
pub trait WireFrame: Serialize + DeserializeOwned {
    fn frame(&self) -> io::Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(self).map_err(malformed)?;
        frame.push(b'\n');
        Ok(frame)
    }

    async fn send<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        writer.write_all(&self.frame()?).await?;
        writer.flush().await
    }

    async fn receive<R>(reader: &mut R) -> io::Result<Option<Self>>
    where
        R: AsyncBufRead + Unpin + Send,
        Self: Sized,
    {
        let mut frame = Vec::new();
        loop {
            frame.clear();
            if reader.read_until(b'\n', &mut frame).await? == 0 {
                return Ok(None);
            }
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            // serde_json tolerates the trailing newline.
            return serde_json::from_slice(&frame).map(Some).map_err(malformed);
        }
    }
}

fn malformed(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// What the runtime pipes to a hook subprocess on stdin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_use_id: String,
    #[serde(default)]
    pub tool_response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRequest {
    pub event: HookEventName,
    pub input: HookInput,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookServiceResponse {
    #[serde(default)]
    pub output: HookOutput,
    #[serde(default)]
    pub force_continue: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// The Stop hook speaks a different dialect: `decision: block` pushes the
/// agent into another turn.
#[derive(Debug, Serialize)]
pub struct StopOutput {
    pub decision: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WireFrame for HookRequest {}
impl WireFrame for HookServiceResponse {}

// The runtime's stream-json stdio rides the same framing.
impl WireFrame for InputMessage {}
impl WireFrame for StreamMessage {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn hook_request_round_trips_through_a_frame() {
        let (mut a, b) = tokio::io::duplex(4096);
        let mut b = BufReader::new(b);

        let sent = HookRequest {
            event: HookEventName::PreToolUse,
            input: HookInput {
                cwd: "/work".to_owned(),
                tool_name: "Bash".to_owned(),
                tool_input: serde_json::json!({"command": "ls"}),
                tool_use_id: "tu-1".to_owned(),
                tool_response: Value::Null,
            },
        };
        sent.send(&mut a).await.unwrap();

        let got = HookRequest::receive(&mut b).await.unwrap().unwrap();
        assert_eq!(got.event, HookEventName::PreToolUse);
        assert_eq!(got.input.tool_name, "Bash");
        assert_eq!(got.input.tool_input["command"], "ls");
    }

    #[test]
    fn frames_end_with_exactly_one_newline() {
        let frame = HookServiceResponse::default().frame().unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[tokio::test]
    async fn receive_skips_blank_lines_and_reports_eof() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut b = BufReader::new(b);

        a.write_all(b"\n  \n").await.unwrap();
        HookServiceResponse {
            force_continue: true,
            ..Default::default()
        }
        .send(&mut a)
        .await
        .unwrap();
        drop(a);

        let got = HookServiceResponse::receive(&mut b).await.unwrap().unwrap();
        assert!(got.force_continue);
        let eof = HookServiceResponse::receive(&mut b).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn malformed_frame_is_invalid_data() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut b = BufReader::new(b);
        a.write_all(b"{nope}\n").await.unwrap();

        let err = HookRequest::receive(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn runtime_user_turns_use_the_same_framing() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut b = BufReader::new(b);

        aleph_core::stream::user_turn("hello").send(&mut a).await.unwrap();
        let got = InputMessage::receive(&mut b).await.unwrap().unwrap();
        assert_eq!(got.message.content, "hello");
    }

    #[test]
    fn stop_output_serializes_block() {
        let out = StopOutput {
            decision: "block",
            reason: Some("unread mail".to_owned()),
        };
        assert_eq!(
            serde_json::to_string(&out).unwrap(),
            r#"{"decision":"block","reason":"unread mail"}"#
        );
    }
}
