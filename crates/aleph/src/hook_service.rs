//! Per-agent unix socket serving hook requests.
//!
//! The runtime's hook subprocesses (`aleph hook <event>`) connect here, ship
//! the raw hook input across, and get the aggregated envelope back. The bus
//! itself serialises chains, so concurrent connections still execute their
//! handlers one at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use aleph_core::hooks::{HookEvent, HookEventName, HookOutput, ToolCall};

use crate::ipc::{HookInput, HookRequest, HookServiceResponse, WireFrame as _};
use crate::hook_bus::HookBus;

pub fn event_from_input(event: HookEventName, input: HookInput) -> HookEvent {
    let call = ToolCall {
        tool_name: input.tool_name,
        arguments: input.tool_input,
        tool_use_id: if input.tool_use_id.is_empty() {
            None
        } else {
            Some(input.tool_use_id)
        },
    };
    match event {
        HookEventName::PreToolUse => HookEvent::PreToolUse(call),
        HookEventName::PostToolUse => {
            let (result, is_error) = match &input.tool_response {
                serde_json::Value::String(s) => (s.clone(), false),
                serde_json::Value::Null => (String::new(), false),
                other => (
                    other.to_string(),
                    other
                        .get("is_error")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                ),
            };
            HookEvent::PostToolUse {
                call,
                result,
                is_error,
            }
        }
        HookEventName::SessionStart => HookEvent::SessionStart,
        HookEventName::Stop => HookEvent::Stop,
    }
}

pub struct HookService {
    socket_path: PathBuf,
}

impl HookService {
    /// Bind the agent's hook socket, replacing any stale leftover.
    pub fn bind(socket_path: &Path) -> anyhow::Result<(Self, UnixListener)> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("remove stale socket {}", socket_path.display()))?;
        }
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("bind {}", socket_path.display()))?;
        Ok((
            Self {
                socket_path: socket_path.to_path_buf(),
            },
            listener,
        ))
    }

    pub async fn serve(
        &self,
        listener: UnixListener,
        bus: Arc<HookBus>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let Ok((stream, _addr)) = accepted else { break };
                    let bus = bus.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, bus).await {
                            tracing::debug!(error = %err, "hook connection failed");
                        }
                    });
                }
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection(stream: UnixStream, bus: Arc<HookBus>) -> anyhow::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    let Some(request) = HookRequest::receive(&mut reader).await? else {
        return Ok(());
    };
    let event_name = request.event;
    let event = event_from_input(request.event, request.input);
    let outcome = bus.dispatch(&event).await;

    let response = HookServiceResponse {
        output: HookOutput::from_outcome(event_name, &outcome),
        force_continue: outcome.force_continue,
        context: outcome.additional_context.clone(),
    };
    response.send(&mut writer).await?;
    Ok(())
}

/// Client side, used by the `aleph hook` forwarder subcommand.
pub async fn forward(
    socket_path: &Path,
    request: &HookRequest,
) -> anyhow::Result<HookServiceResponse> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connect {}", socket_path.display()))?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    request.send(&mut writer).await?;
    let response = HookServiceResponse::receive(&mut reader)
        .await?
        .context("hook service closed without responding")?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook_bus::{HookBus, HookHandler};
    use aleph_core::hooks::HookDecision;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct EchoContext;

    #[async_trait]
    impl HookHandler for EchoContext {
        fn name(&self) -> &'static str {
            "echo"
        }
        async fn handle(&self, event: &HookEvent) -> anyhow::Result<HookDecision> {
            match event {
                HookEvent::PostToolUse { call, .. } => Ok(HookDecision::context(format!(
                    "saw {}",
                    call.tool_name
                ))),
                HookEvent::Stop => Ok(HookDecision {
                    force_continue: true,
                    ..HookDecision::context("stay")
                }),
                _ => Ok(HookDecision::defer()),
            }
        }
    }

    fn request(event: HookEventName, tool_name: &str) -> HookRequest {
        HookRequest {
            event,
            input: HookInput {
                cwd: String::new(),
                tool_name: tool_name.to_owned(),
                tool_input: serde_json::json!({}),
                tool_use_id: String::new(),
                tool_response: serde_json::Value::String("ok".to_owned()),
            },
        }
    }

    #[tokio::test]
    async fn round_trip_through_the_socket() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("agent.sock");

        let mut bus = HookBus::new();
        bus.register(HookEventName::PostToolUse, Arc::new(EchoContext));
        bus.register(HookEventName::Stop, Arc::new(EchoContext));
        let bus = Arc::new(bus);

        let (service, listener) = HookService::bind(&socket).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            service.serve(listener, bus, shutdown_rx).await;
        });

        let response = forward(&socket, &request(HookEventName::PostToolUse, "Bash"))
            .await
            .unwrap();
        assert_eq!(response.context.as_deref(), Some("saw Bash"));
        assert!(!response.force_continue);
        let json = serde_json::to_value(&response.output).unwrap();
        assert_eq!(
            json["hookSpecificOutput"]["hookEventName"],
            serde_json::json!("PostToolUse")
        );

        let response = forward(&socket, &request(HookEventName::Stop, ""))
            .await
            .unwrap();
        assert!(response.force_continue);

        let _ = shutdown_tx.send(true);
        let _ = server.await;
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("agent.sock");
        std::fs::write(&socket, b"stale").unwrap();

        let (_service, _listener) = HookService::bind(&socket).unwrap();
    }

    #[test]
    fn post_tool_use_input_maps_response_fields() {
        let event = event_from_input(
            HookEventName::PostToolUse,
            HookInput {
                cwd: String::new(),
                tool_name: "Bash".to_owned(),
                tool_input: serde_json::json!({"command": "ls"}),
                tool_use_id: "tu-9".to_owned(),
                tool_response: serde_json::json!({"output": "x", "is_error": true}),
            },
        );
        match event {
            HookEvent::PostToolUse {
                call,
                result,
                is_error,
            } => {
                assert_eq!(call.tool_use_id.as_deref(), Some("tu-9"));
                assert!(is_error);
                assert!(result.contains("output"));
            }
            other => panic!("expected PostToolUse, got {other:?}"),
        }
    }
}
