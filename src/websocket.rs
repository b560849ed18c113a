//! # WebSocket Session Streaming
//!
//! Streams one session's feature records and analysis reports to a browser.
//! Clients connect to `/ws/{session_id}` after uploading a file.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the session must exist, otherwise the upgrade is refused with 404
//! 2. **Start**: production is started if it isn't running yet and the current status is sent
//! 3. **Requests**: the client pulls with `get_chunk` / `get_analysis` or queries by time
//! 4. **Push**: while the client is quiet, queued records and reports are pushed in batches
//! 5. **End**: once production is done and both queues are empty the final status is
//!    sent and the socket is closed; a failed session gets an `error` first
//!
//! ## Message Format:
//! - **Client → Server**: `{"action": "...", "current_time"?: f64, "buffer_ahead"?: f64}`
//! - **Server → Client**: `{"type": "...", "data": ...}` (see `streaming::protocol`)

use crate::config::AppConfig;
use crate::error::{AppError, StreamError};
use crate::state::AppState;
use crate::streaming::protocol::{self, RequestPlan, StreamMessage};
use crate::streaming::{SessionHandle, SessionState, SessionStatus};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// Connection timing and batching, read from the config once per connection.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverySettings {
    pub client_poll_timeout: Duration,
    pub pull_timeout: Duration,
    pub drain_batch_size: usize,
    pub status_interval_chunks: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub teardown_on_disconnect: bool,
}

impl DeliverySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            client_poll_timeout: config.streaming.client_poll_timeout(),
            pull_timeout: config.streaming.pull_timeout(),
            drain_batch_size: config.streaming.drain_batch_size,
            status_interval_chunks: config.streaming.status_interval_chunks.max(1),
            heartbeat_interval: Duration::from_secs(config.performance.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.performance.client_timeout_secs),
            teardown_on_disconnect: config.streaming.teardown_on_disconnect,
        }
    }
}

/// Decides which published states are worth a `status` message.
#[derive(Debug, Clone)]
struct StatusCadence {
    interval: usize,
    last_status: Option<SessionStatus>,
    last_chunks: usize,
}

impl StatusCadence {
    fn new(interval: usize) -> Self {
        Self {
            interval,
            last_status: None,
            last_chunks: 0,
        }
    }

    /// Push on every transition and every `interval` processed chunks.
    fn should_push(&self, state: &SessionState) -> bool {
        self.last_status != Some(state.status)
            || state.processed_chunks >= self.last_chunks + self.interval
    }

    fn mark(&mut self, state: &SessionState) {
        self.last_status = Some(state.status);
        self.last_chunks = state.processed_chunks;
    }
}

/// WebSocket actor bound to one streaming session.
pub struct StreamWebSocket {
    session: SessionHandle,
    app_state: web::Data<AppState>,
    delivery: DeliverySettings,
    cadence: StatusCadence,

    /// Last ping/pong from the client
    last_heartbeat: Instant,

    /// Last request from the client; the server only pushes while the client is quiet
    last_client_message: Instant,

    /// Set once the closing sequence has been sent
    closing: bool,
}

impl StreamWebSocket {
    pub fn new(session: SessionHandle, app_state: web::Data<AppState>) -> Self {
        let delivery = DeliverySettings::from_config(&app_state.get_config());
        let now = Instant::now();
        Self {
            session,
            app_state,
            cadence: StatusCadence::new(delivery.status_interval_chunks),
            delivery,
            last_heartbeat: now,
            last_client_message: now,
            closing: false,
        }
    }

    fn send(&mut self, ctx: &mut ws::WebsocketContext<Self>, message: &StreamMessage) {
        if let StreamMessage::Status(state) = message {
            self.cadence.mark(state);
        }
        ctx.text(message.to_json());
    }

    fn send_status(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let message = StreamMessage::Status(self.session.snapshot());
        self.send(ctx, &message);
    }

    fn close_with(&mut self, ctx: &mut ws::WebsocketContext<Self>, code: ws::CloseCode, description: &str) {
        self.closing = true;
        ctx.close(Some(ws::CloseReason {
            code,
            description: Some(description.to_string()),
        }));
        ctx.stop();
    }

    /// Runs every `client_poll_timeout`: push queued items while the client is
    /// quiet, then see whether the stream is over.
    fn poll_tick(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if self.closing {
            return;
        }

        if self.last_client_message.elapsed() >= self.delivery.client_poll_timeout {
            for message in protocol::drain_ready(&self.session, self.delivery.drain_batch_size) {
                self.send(ctx, &message);
            }
        }

        self.check_finished(ctx);
    }

    fn check_finished(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if self.closing {
            return;
        }

        if self.session.is_released() {
            let message = StreamMessage::error("Session was terminated");
            self.send(ctx, &message);
            self.close_with(ctx, ws::CloseCode::Away, "session terminated");
            return;
        }

        let state = self.session.snapshot();
        match state.status {
            SessionStatus::Completed if protocol::stream_exhausted(&self.session) => {
                info!(session_id = %self.session.id(), "Stream delivered, closing connection");
                self.send(ctx, &StreamMessage::Status(state));
                self.close_with(ctx, ws::CloseCode::Normal, "stream complete");
            }
            SessionStatus::Failed => {
                let reason = state
                    .error
                    .clone()
                    .unwrap_or_else(|| "Processing failed".to_string());
                warn!(session_id = %self.session.id(), error = %reason, "Closing connection for failed session");
                self.send(ctx, &StreamMessage::error(reason));
                self.send(ctx, &StreamMessage::Status(state));
                self.close_with(ctx, ws::CloseCode::Error, "processing failed");
            }
            _ => {}
        }
    }

    fn handle_request(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        self.last_client_message = Instant::now();

        let timeout = self.delivery.pull_timeout;
        let session = self.session.clone();
        match protocol::plan_request(&self.session, text) {
            RequestPlan::Reply(messages) => {
                for message in messages {
                    if let StreamMessage::Error { message: reason } = &message {
                        debug!(session_id = %self.session.id(), error = %reason, "Rejected client request");
                    }
                    self.send(ctx, &message);
                }
            }
            // `wait` holds other events back until the answer is sent, so a pushed
            // batch can never overtake the pulled item.
            RequestPlan::PullChunk => {
                ctx.wait(
                    async move { protocol::pull_chunk(&session, timeout).await }
                        .into_actor(self)
                        .map(|message, act, ctx| act.send(ctx, &message)),
                );
            }
            RequestPlan::PullAnalysis => {
                ctx.wait(
                    async move { protocol::pull_analysis(&session, timeout).await }
                        .into_actor(self)
                        .map(|message, act, ctx| act.send(ctx, &message)),
                );
            }
        }
    }
}

impl Actor for StreamWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        let session_id = self.session.id().to_string();
        info!(session_id = %session_id, "WebSocket connection started");
        self.app_state.connection_opened();

        if let Err(err) = self.app_state.sessions.start(&session_id) {
            let message = StreamMessage::error(err.to_string());
            self.send(ctx, &message);
            self.close_with(ctx, ws::CloseCode::Away, "session unavailable");
            return;
        }

        self.send_status(ctx);
        ctx.add_stream(WatchStream::new(self.session.subscribe()));

        ctx.run_interval(self.delivery.client_poll_timeout, |act, ctx| act.poll_tick(ctx));

        ctx.run_interval(self.delivery.heartbeat_interval, |act, ctx| {
            if act.last_heartbeat.elapsed() > act.delivery.client_timeout {
                let err = StreamError::ConnectionLost("heartbeat timeout".to_string());
                warn!(session_id = %act.session.id(), error = %err, "Closing unresponsive connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Called when the WebSocket connection stops, however it stopped.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.app_state.connection_closed();
        let session_id = self.session.id();
        info!(session_id = %session_id, "WebSocket connection stopped");

        if self.delivery.teardown_on_disconnect {
            self.app_state.sessions.terminate(session_id);
        }
    }
}

/// Published session states.
impl StreamHandler<SessionState> for StreamWebSocket {
    fn handle(&mut self, state: SessionState, ctx: &mut Self::Context) {
        if self.closing {
            return;
        }

        if state.status.is_terminal() {
            // Completed waits until the queues are drained; Failed closes right away.
            self.check_finished(ctx);
        } else if self.cadence.should_push(&state) {
            self.send(ctx, &StreamMessage::Status(state));
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(session_id = %self.session.id(), "Session state stream ended");
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for StreamWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_request(&text, ctx),
            Ok(ws::Message::Binary(_)) => {
                let message = StreamMessage::error("Binary messages are not supported");
                self.send(ctx, &message);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session.id(), ?reason, "Client closed the connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                let err = StreamError::ConnectionLost(err.to_string());
                warn!(session_id = %self.session.id(), error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler for `GET /ws/{session_id}`.
///
/// ## HTTP to WebSocket Upgrade:
/// The session lookup happens before the upgrade so an unknown id gets a
/// plain 404 JSON error instead of a socket that closes immediately.
pub async fn session_stream(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let session_id = path.into_inner();
    debug!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "WebSocket connection request"
    );

    let session = app_state
        .sessions
        .get(&session_id)
        .ok_or_else(|| AppError::from(StreamError::SessionNotFound(session_id.clone())))?;

    ws::start(StreamWebSocket::new(session, app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sequencer::tests::RecordingExtractor;
    use crate::state::tests::test_state;
    use crate::streaming::manager::tests::manager_with;
    use crate::streaming::session::tests::test_file_info;
    use actix_web::{dev::ServerHandle, http::StatusCode, test as actix_test, App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn state_at(status: SessionStatus, processed_chunks: usize) -> SessionState {
        SessionState {
            status,
            progress: 0.0,
            total_chunks: 100,
            processed_chunks,
            duration: 20.0,
            error: None,
        }
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.streaming.producer_yield_ms = 0;
        config.streaming.client_poll_timeout_ms = 20;
        config
    }

    fn serve(state: AppState) -> (SocketAddr, ServerHandle) {
        let data = web::Data::new(state);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/ws/{session_id}", web::get().to(session_stream))
        })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .unwrap();

        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);
        (addr, handle)
    }

    async fn connect(addr: SocketAddr, session_id: &str) -> Client {
        let url = format!("ws://{}/ws/{}", addr, session_id);
        let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
    }

    async fn send_action(client: &mut Client, request: &str) {
        client.send(Message::Text(request.to_string())).await.unwrap();
    }

    async fn next_text(client: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("no message in time")
                .expect("connection ended")
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Every text message up to the server's close frame, plus the close code.
    async fn read_until_close(client: &mut Client) -> (Vec<Value>, Option<u16>) {
        let mut messages: Vec<Value> = Vec::new();
        let read = async {
            while let Some(frame) = client.next().await {
                match frame.unwrap() {
                    Message::Text(text) => messages.push(serde_json::from_str(&text).unwrap()),
                    Message::Close(frame) => return frame.map(|frame| u16::from(frame.code)),
                    _ => {}
                }
            }
            None
        };
        let code = tokio::time::timeout(Duration::from_secs(10), read)
            .await
            .expect("server never closed the connection");
        (messages, code)
    }

    async fn wait_until_removed(state: &AppState, session_id: &str) -> bool {
        for _ in 0..100 {
            if state.sessions.get(session_id).is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_status_cadence() {
        let mut cadence = StatusCadence::new(10);
        let ready = state_at(SessionStatus::Ready, 0);
        assert!(cadence.should_push(&ready));
        cadence.mark(&ready);
        assert!(!cadence.should_push(&ready));

        // transition
        let processing = state_at(SessionStatus::Processing, 1);
        assert!(cadence.should_push(&processing));
        cadence.mark(&processing);

        assert!(!cadence.should_push(&state_at(SessionStatus::Processing, 10)));
        let milestone = state_at(SessionStatus::Processing, 11);
        assert!(cadence.should_push(&milestone));
        cadence.mark(&milestone);
        assert!(!cadence.should_push(&state_at(SessionStatus::Processing, 15)));
    }

    #[test]
    fn test_delivery_settings_follow_config() {
        let mut config = AppConfig::default();
        config.streaming.pull_timeout_ms = 250;
        config.streaming.teardown_on_disconnect = false;

        let delivery = DeliverySettings::from_config(&config);
        assert_eq!(delivery.client_poll_timeout, Duration::from_millis(100));
        assert_eq!(delivery.pull_timeout, Duration::from_millis(250));
        assert_eq!(delivery.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(delivery.client_timeout, Duration::from_secs(60));
        assert!(!delivery.teardown_on_disconnect);
    }

    #[actix_web::test]
    async fn test_unknown_session_is_404_before_upgrade() {
        let state = web::Data::new(test_state(AppConfig::default()));
        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws/{session_id}", web::get().to(session_stream)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/ws/session_missing").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "not_found");
    }

    #[actix_web::test]
    async fn test_quiet_client_receives_whole_stream_then_close() {
        let state = test_state(fast_config());
        // 1000 Hz, 0.2s windows: 5 records and one report
        let session = state
            .sessions
            .create(test_file_info(1.0), vec![0.1; 1000], 1000, None)
            .unwrap();
        let session_id = session.id().to_string();
        let (addr, server) = serve(state.clone());

        let mut client = connect(addr, &session_id).await;
        let (messages, close_code) = read_until_close(&mut client).await;

        assert_eq!(messages[0]["type"], "status");
        let timestamps: Vec<f64> = messages
            .iter()
            .filter(|m| m["type"] == "chunk_data")
            .map(|m| m["data"]["timestamp"].as_f64().unwrap())
            .collect();
        assert_eq!(timestamps.len(), 5);
        assert!(timestamps.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(messages.iter().filter(|m| m["type"] == "audio_analysis").count(), 1);

        let last = messages.last().unwrap();
        assert_eq!(last["type"], "status");
        assert_eq!(last["data"]["status"], "completed");
        assert_eq!(last["data"]["processed_chunks"], 5);
        assert_eq!(close_code, Some(1000));

        assert!(wait_until_removed(&state, &session_id).await);
        assert!(session.is_released());
        server.stop(false).await;
    }

    #[actix_web::test]
    async fn test_pulls_are_answered_in_order() {
        let mut config = fast_config();
        config.streaming.client_poll_timeout_ms = 500;
        let state = test_state(config);
        let session = state
            .sessions
            .create(test_file_info(1.0), vec![0.1; 1000], 1000, None)
            .unwrap();
        let session_id = session.id().to_string();

        // produce everything up front so nothing but replies reach the client
        state.sessions.start(&session_id).unwrap();
        for _ in 0..100 {
            if session.snapshot().status == SessionStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.snapshot().status, SessionStatus::Completed);

        let (addr, server) = serve(state.clone());
        let mut client = connect(addr, &session_id).await;
        let greeting = next_text(&mut client).await;
        assert_eq!(greeting["data"]["status"], "completed");

        for expected in [0.0, 0.2, 0.4, 0.6, 0.8] {
            send_action(&mut client, r#"{"action":"get_chunk"}"#).await;
            let reply = next_text(&mut client).await;
            assert_eq!(reply["type"], "chunk_data");
            assert!((reply["data"]["timestamp"].as_f64().unwrap() - expected).abs() < 1e-9);
        }

        send_action(&mut client, r#"{"action":"get_analysis"}"#).await;
        let reply = next_text(&mut client).await;
        assert_eq!(reply["type"], "audio_analysis");
        assert!(!reply["data"].is_null());

        send_action(
            &mut client,
            r#"{"action":"get_chunks_for_time","current_time":0.3,"buffer_ahead":0.2}"#,
        )
        .await;
        let reply = next_text(&mut client).await;
        assert_eq!(reply["type"], "chunk_data");
        assert!((reply["data"]["timestamp"].as_f64().unwrap() - 0.4).abs() < 1e-9);

        send_action(&mut client, r#"{"action":"dance"}"#).await;
        let reply = next_text(&mut client).await;
        assert_eq!(reply["type"], "error");

        // both queues are at their end markers; going quiet ends the stream
        let (rest, close_code) = read_until_close(&mut client).await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0]["type"], "status");
        assert_eq!(rest[0]["data"]["status"], "completed");
        assert_eq!(close_code, Some(1000));
        server.stop(false).await;
    }

    #[actix_web::test]
    async fn test_failed_session_sends_error_then_status() {
        let extractor = Arc::new(RecordingExtractor {
            fail_at: Some(0.5),
            ..Default::default()
        });
        // 0.25s windows: the third window fails
        let state = AppState::new(fast_config(), Arc::new(manager_with(4, extractor)));
        let session = state
            .sessions
            .create(test_file_info(1.0), vec![0.1; 1000], 1000, None)
            .unwrap();
        let session_id = session.id().to_string();
        let (addr, server) = serve(state.clone());

        let mut client = connect(addr, &session_id).await;
        let (messages, close_code) = read_until_close(&mut client).await;

        let n = messages.len();
        assert!(n >= 3);
        assert_eq!(messages[n - 2]["type"], "error");
        assert!(messages[n - 2]["data"]["message"]
            .as_str()
            .unwrap()
            .contains("window 2"));
        assert_eq!(messages[n - 1]["type"], "status");
        assert_eq!(messages[n - 1]["data"]["status"], "failed");
        assert_eq!(messages[n - 1]["data"]["processed_chunks"], 2);
        assert_eq!(close_code, Some(1011));

        assert!(wait_until_removed(&state, &session_id).await);
        server.stop(false).await;
    }

    #[actix_web::test]
    async fn test_client_disconnect_tears_down_session() {
        let mut config = fast_config();
        config.streaming.producer_yield_ms = 50;
        let state = test_state(config);
        // 100 windows at 50ms each: still producing when the client leaves
        let session = state
            .sessions
            .create(test_file_info(20.0), vec![0.1; 20_000], 1000, None)
            .unwrap();
        let session_id = session.id().to_string();
        let (addr, server) = serve(state.clone());

        let mut client = connect(addr, &session_id).await;
        assert_eq!(next_text(&mut client).await["type"], "status");
        client.close(None).await.unwrap();

        assert!(wait_until_removed(&state, &session_id).await);
        assert!(session.is_released());
        assert_ne!(session.snapshot().status, SessionStatus::Completed);
        server.stop(false).await;
    }

    #[actix_web::test]
    async fn test_session_survives_disconnect_without_teardown() {
        let mut config = fast_config();
        config.streaming.teardown_on_disconnect = false;
        let state = test_state(config);
        let session = state
            .sessions
            .create(test_file_info(1.0), vec![0.1; 1000], 1000, None)
            .unwrap();
        let session_id = session.id().to_string();
        let (addr, server) = serve(state.clone());

        let mut client = connect(addr, &session_id).await;
        let (_, close_code) = read_until_close(&mut client).await;
        assert_eq!(close_code, Some(1000));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(state.sessions.get(&session_id).is_some());
        assert!(!session.is_released());
        server.stop(false).await;
    }
}
