//! WebSocket handler — the bridge between the browser SDK and server state.
//!
//! DESIGN
//! ======
//! On upgrade, builds a fresh `Loading` session for the connection and
//! enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Frames pushed by the session (transitions, handler output, page-load
//!   items) → forward to client
//!
//! Session frames are committed inline so transitions apply in arrival order.
//! Auth-change handlers then run on the connection's dispatch queue, and a
//! navigation (`page:load`) cancels whatever they are still doing.
//! Page loads run as spawned tasks: they usually start before the browser
//! SDK settles and must wait on the guard without blocking the loop that
//! will deliver the settling frame.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id` and publishable key
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch turns the Outcome into a reply for the sender
//! 4. Close → abort any in-flight page load → let queued handlers finish

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame, Status};
use crate::state::AppState;
use crate::sync::{SyncEvent, Synchronizer};

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer turns it into
/// frames for the sender.
enum Outcome {
    /// Send done+data to sender.
    Reply(Data),
    /// Nothing to send now; a spawned task owns the response stream.
    Streaming,
}

// =============================================================================
// CONNECTION
// =============================================================================

/// A page load in flight, cancellable by its request id.
struct PageLoad {
    request_id: Uuid,
    handle: JoinHandle<()>,
}

/// Per-connection state owned by the ws loop.
struct Connection {
    client_id: Uuid,
    sync: Synchronizer,
    page_load: Option<PageLoad>,
}

impl Connection {
    fn new(state: &AppState, client_id: Uuid, outbox: mpsc::Sender<Frame>) -> Self {
        let session = Arc::new(state.new_session(outbox));
        Self { client_id, sync: Synchronizer::queued(session), page_load: None }
    }

    /// Abort the in-flight page load, if any.
    fn abort_page_load(&mut self) {
        if let Some(load) = self.page_load.take() {
            load.handle.abort();
        }
    }

    /// Leaving the page: drop its load and any handler work in flight.
    fn navigate(&mut self) {
        self.abort_page_load();
        self.sync.cancel_dispatch();
    }

    /// Abort the in-flight page load if `target` names it.
    fn cancel(&mut self, target: Option<Uuid>) -> bool {
        let matches = self
            .page_load
            .as_ref()
            .is_some_and(|load| Some(load.request_id) == target);
        if matches {
            self.abort_page_load();
        }
        matches
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for frames pushed by the session and page loads.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(256);
    let mut conn = Connection::new(&state, client_id, client_tx);

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("publishable_key", state.config.publishable_key.clone());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%client_id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        dispatch_frame(&state, &mut socket, &mut conn, &text).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    conn.abort_page_load();
    conn.sync.close();
    info!(%client_id, status = ?conn.sync.session().status(), "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse an incoming JSON frame, dispatch to handler, send the reply.
async fn dispatch_frame(state: &AppState, socket: &mut WebSocket, conn: &mut Connection, text: &str) {
    let sender_frames = process_inbound_text(state, conn, text).await;
    for frame in sender_frames {
        let _ = send_frame(socket, &frame).await;
    }
}

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Keeps websocket transport concerns out of frame handling so tests can
/// drive dispatch without a socket.
async fn process_inbound_text(state: &AppState, conn: &mut Connection, text: &str) -> Vec<Frame> {
    let client_id = conn.client_id;
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };
    req.from = Some(client_id.to_string());

    if req.status == Status::Cancel {
        let cancelled = conn.cancel(req.parent_id);
        info!(%client_id, target = ?req.parent_id, cancelled, "ws: cancel");
        return vec![];
    }

    info!(%client_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    let result = match req.prefix() {
        "session" => handle_session(conn, &req).await,
        "page" => handle_page(state, conn, &req),
        "user" => handle_user(conn, &req).await,
        prefix => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Streaming) => vec![],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// SESSION HANDLERS
// =============================================================================

async fn handle_session(conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    if req.op() == "get" {
        return Ok(Outcome::Reply(conn.sync.session().snapshot().to_data()));
    }

    let event = SyncEvent::from_frame(req).map_err(|e| req.error_from(&e))?;
    match conn.sync.handle(event).await {
        Ok(outcome) => {
            let mut data = conn.sync.session().snapshot().to_data();
            data.insert("changed".into(), serde_json::json!(outcome.fired()));
            Ok(Outcome::Reply(data))
        }
        Err(e) => Err(req.error_from(&e)),
    }
}

// =============================================================================
// PAGE HANDLERS
// =============================================================================

fn handle_page(state: &AppState, conn: &mut Connection, req: &Frame) -> Result<Outcome, Frame> {
    let op = req.op();
    if op != "load" {
        return Err(req.error(format!("unknown page op: {op}")));
    }
    let Some(route) = req.str_field("route") else {
        return Err(req.error("route required"));
    };
    let Some(sequence) = state.pages.get(route) else {
        return Err(req.error(format!("unknown route: {route}")));
    };

    conn.navigate();

    let request_id = req.id;
    let session = Arc::clone(conn.sync.session());
    let req = req.clone();
    let route = route.to_string();
    let handle = tokio::spawn(async move {
        let report = sequence
            .run_with(&session, |outcome| {
                session.emit(req.item(outcome.to_data()));
            })
            .await;
        let mut done = report.to_data();
        done.insert("route".into(), serde_json::json!(route));
        session.emit(req.done_with(done));
    });

    conn.page_load = Some(PageLoad { request_id, handle });
    Ok(Outcome::Streaming)
}

// =============================================================================
// USER HANDLERS
// =============================================================================

async fn handle_user(conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    let session = conn.sync.session();
    let Some(user_info) = session.user_info() else {
        return Err(req.error("user info state not registered"));
    };

    match req.op() {
        "load" => match user_info.load(session).await {
            Ok(_) => Ok(Outcome::Reply(user_info.snapshot().to_data())),
            Err(e) => Err(req.error_from(&e)),
        },
        "get" => Ok(Outcome::Reply(user_info.snapshot().to_data())),
        op => Err(req.error(format!("unknown user op: {op}"))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame
            .data
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        let message = frame
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
