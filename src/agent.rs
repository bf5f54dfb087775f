//! Agent run loop.
//!
//! Instructions are handled one at a time in arrival order, and each
//! response is written before the next frame is looked at. The controller
//! correlates responses by position, so this ordering is the protocol.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::console::{Console, WorkflowConsole};
use crate::dispatch::Dispatcher;
use crate::transport::{Connection, ConnectionEvent, Response};

/// Connect to the configured controller and serve it until it disconnects.
pub async fn run(config: Config) -> Result<()> {
    config.validate()?;

    let console: Arc<dyn Console> = Arc::new(WorkflowConsole::stdout());
    let dispatcher = Dispatcher::new(&config, console);

    info!(
        endpoint = %config.endpoint,
        workspace = %config.workspace.display(),
        "Connecting to controller"
    );
    let connection = Connection::open(&config.endpoint, config.heartbeat_interval)
        .await
        .context("Failed to open controller connection")?;

    serve(connection, &dispatcher).await
}

/// Handle events from `connection` until it closes.
///
/// Background jobs started during the session are left running.
pub async fn serve(mut connection: Connection, dispatcher: &Dispatcher) -> Result<()> {
    let outbound = connection.outbound();

    while let Some(event) = connection.next_event().await {
        match event {
            ConnectionEvent::Opened => debug!("Controller connection ready"),
            ConnectionEvent::Frame(frame) => {
                if !outbound.is_open() {
                    debug!("Connection already closed, dropping frame");
                    continue;
                }
                let response = match dispatcher.handle(&frame).await {
                    Ok(Some(response)) => response,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(error = %e, frame = %frame, "Failed to handle instruction");
                        if !e.expects_response() {
                            continue;
                        }
                        Response::error(e.to_string())
                    }
                };
                let text = response.encode().context("Failed to encode response")?;
                if let Err(e) = outbound.send_text(text) {
                    warn!(error = %e, "Dropping response");
                }
            }
            ConnectionEvent::Closed { code, reason } => {
                info!(?code, reason = %reason, "Connection closed.");
                break;
            }
        }
    }

    let running = dispatcher.jobs().ids().await;
    if !running.is_empty() {
        info!(jobs = ?running, "Leaving background jobs running");
    }
    connection.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;

    fn config(dir: &std::path::Path, endpoint: String) -> Config {
        let workspace = dir.join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        Config {
            workspace,
            endpoint,
            repository: "neoforged/NeoForge".into(),
            run_id: 7,
            user_home: PathBuf::from("/home/runner"),
            scratch_dir: dir.join("scratch"),
            cache_dir: dir.join("cache"),
            evaluator: None,
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    /// Plays the controller: sends `frames` in one burst, collects the
    /// expected number of text responses, then closes.
    async fn controller(listener: TcpListener, frames: Vec<Value>, expected: usize) -> Vec<Value> {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        for frame in frames {
            ws.send(Message::Text(frame.to_string().into())).await.unwrap();
        }

        let mut responses = Vec::new();
        while responses.len() < expected {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => responses.push(serde_json::from_str(text.as_str()).unwrap()),
                Message::Close(_) => break,
                _ => {}
            }
        }

        ws.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        }))
        .await
        .unwrap();
        responses
    }

    #[tokio::test]
    async fn responses_follow_instruction_order() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let config = config(dir.path(), endpoint.clone());

        let frames = vec![
            json!({"type": "details"}),
            json!({"type": "log", "message": "Running setup commands..."}),
            json!({"type": "no-such-kind"}),
            json!({"type": "write-file", "path": "out/a.txt", "content": "hi"}),
            json!("not an instruction"),
            json!({"type": "log", "message": "x", "level": "notice"}),
            json!({"type": "command", "command": ["sh", "-c", "sleep 0.2; echo slow"]}),
            json!({"type": "read-file", "path": "out/a.txt"}),
            json!({"type": "command", "command": ["sh", "-c", "echo bad >&2; exit 3"]}),
        ];
        let server = tokio::spawn(controller(listener, frames, 7));

        let console: Arc<dyn Console> = Arc::new(WorkflowConsole::new(std::io::sink()));
        let dispatcher = Dispatcher::new(&config, console);
        let connection = Connection::open(&endpoint, config.heartbeat_interval)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), serve(connection, &dispatcher))
            .await
            .unwrap()
            .unwrap();

        let mut responses = server.await.unwrap();
        let rejected = responses.remove(3);
        assert!(rejected["error"].as_str().unwrap().contains("'log'"));
        assert_eq!(
            responses,
            vec![
                json!({"repository": "neoforged/NeoForge", "id": 7, "userHome": "/home/runner"}),
                json!({}),
                json!({}),
                json!({"stdout": "slow\n"}),
                json!({"file": "aGk="}),
                json!({"stderr": "bad\n"}),
            ]
        );
    }

    #[tokio::test]
    async fn run_requires_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), String::new());
        assert!(run(config).await.is_err());
    }

    #[tokio::test]
    async fn run_fails_when_controller_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = run(config(dir.path(), endpoint)).await.unwrap_err();
        assert!(format!("{err:#}").contains("controller"));
    }
}
