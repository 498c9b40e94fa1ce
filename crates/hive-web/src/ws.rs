use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hive_protocol::{TaskSnapshot, TerminalMode};
use libhive::terminal::{BridgeState, ClientFrame, PtyBridge, TerminalSpec, parse_client_frame};

use crate::AppState;
use crate::api::api_error;

const WS_OUTBOUND_BUFFER: usize = 256;
/// Largest single input frame a terminal client may send.
pub const MAX_INPUT_FRAME_BYTES: usize = 1024 * 1024;

/// Spawn the single writer for a socket: everything sent to the returned
/// channel goes out in order, and a close frame follows once every sender is
/// gone.
fn spawn_writer(mut ws_tx: SplitSink<WebSocket, Message>) -> (mpsc::Sender<Message>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Message>(WS_OUTBOUND_BUFFER);
    let task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });
    (tx, task)
}

fn snapshot_message(snapshot: &TaskSnapshot) -> Option<Message> {
    match serde_json::to_string(snapshot) {
        Ok(json) => Some(Message::text(json)),
        Err(err) => {
            warn!(error = %err, "failed to encode task snapshot");
            None
        }
    }
}

/// GET /ws/tasks - current snapshot on connect, then every change.
pub async fn ws_tasks(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_tasks_socket(socket, state))
}

async fn handle_tasks_socket(socket: WebSocket, state: Arc<AppState>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, write_task) = spawn_writer(ws_tx);
    let mut snapshots = state.tasks.subscribe();

    let initial = snapshots.borrow_and_update().clone();
    if let Some(msg) = snapshot_message(&initial) {
        if tx.send(msg).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let Some(msg) = snapshot_message(&snapshot) else {
                    continue;
                };
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(tx);
    let _ = write_task.await;
    debug!("task observer disconnected");
}

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    #[serde(default)]
    pub mode: TerminalMode,
    pub container: Option<String>,
    /// Initial terminal size; both must be non-zero to take effect.
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// GET /ws/terminal?mode=local|docker&container=NAME&cols=N&rows=M
///
/// Bad parameters are rejected before the upgrade.
pub async fn ws_terminal(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TerminalQuery>,
) -> Result<Response, (StatusCode, String)> {
    let mut spec = TerminalSpec::for_mode(query.mode, query.container.as_deref(), &state.shell)
        .map_err(api_error)?;
    if let (Some(cols @ 1..), Some(rows @ 1..)) = (query.cols, query.rows) {
        spec = spec.with_size(cols, rows);
    }
    Ok(ws.on_upgrade(move |socket| handle_terminal_socket(socket, spec)))
}

async fn handle_terminal_socket(socket: WebSocket, spec: TerminalSpec) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, write_task) = spawn_writer(ws_tx);
    debug!(state = ?BridgeState::Connected, program = %spec.program, "terminal client connected");

    let program = spec.program.clone();
    let opened = tokio::task::spawn_blocking(move || PtyBridge::open(&spec))
        .await
        .unwrap_or_else(|err| {
            Err(libhive::HiveError::Pty(format!("spawn task failed: {err}")))
        });
    let bridge = match opened {
        Ok(bridge) => bridge,
        Err(err) => {
            warn!(program = %program, error = %err, "terminal spawn failed");
            let _ = tx
                .send(Message::text(serde_json::json!({"error": err.to_string()}).to_string()))
                .await;
            drop(tx);
            let _ = write_task.await;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
    let (in_tx, in_rx) = mpsc::channel::<ClientFrame>(64);
    let mut bridge_task = tokio::spawn(bridge.run(out_tx, in_rx));

    let notices = tx.clone();
    // Output pump: bridge output → writer. Ends when the bridge drops its
    // sender, which in turn lets the writer send the close frame.
    let output_task = tokio::spawn(async move {
        while let Some(chunk) = out_rx.recv().await {
            if tx.send(Message::Binary(chunk.into())).await.is_err() {
                break;
            }
        }
    });

    let mut finished = None;
    loop {
        tokio::select! {
            reason = &mut bridge_task => {
                finished = Some(reason);
                break;
            }
            msg = ws_rx.next() => {
                let bytes = match msg {
                    Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if bytes.len() > MAX_INPUT_FRAME_BYTES {
                    warn!(len = bytes.len(), "terminal input frame too large, closing");
                    let notice = serde_json::json!({
                        "error": format!("input frame too large: {} > {}", bytes.len(), MAX_INPUT_FRAME_BYTES)
                    });
                    let _ = notices.send(Message::text(notice.to_string())).await;
                    break;
                }
                match parse_client_frame(bytes) {
                    Ok(frame) => {
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!(error = %err, "ignoring bad control frame"),
                }
            }
        }
    }

    drop(in_tx);
    drop(notices);
    let reason = match finished {
        Some(reason) => reason,
        None => bridge_task.await,
    };
    let _ = output_task.await;
    let _ = write_task.await;
    match reason {
        Ok(reason) => info!(?reason, "terminal connection closed"),
        Err(err) => warn!(error = %err, "terminal bridge task failed"),
    }
}
