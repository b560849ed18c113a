//! WebSocket message envelope and client request handling.
//!
//! Server messages are `{"type": ..., "data": ...}`. Client messages are
//! `{"action": ..., "current_time"?: f64, "buffer_ahead"?: f64}`.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;

use super::queue::Dequeued;
use super::session::{SessionState, StreamSession};
use crate::analysis::AnalysisReport;
use crate::audio::FeatureRecord;

/// Look-ahead used by `get_chunks_for_time` when the client sends none.
pub const DEFAULT_BUFFER_AHEAD: f64 = 3.0;

/// Everything the server sends over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamMessage {
    ChunkData(FeatureRecord),
    /// `null` when no report exists yet.
    AudioAnalysis(Option<AnalysisReport>),
    Status(SessionState),
    Error { message: String },
}

impl StreamMessage {
    pub fn error(message: impl Into<String>) -> Self {
        StreamMessage::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::ChunkData(_) => "chunk_data",
            StreamMessage::AudioAnalysis(_) => "audio_analysis",
            StreamMessage::Status(_) => "status",
            StreamMessage::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            json!({
                "type": "error",
                "data": { "message": format!("failed to encode {} message: {}", self.kind(), err) }
            })
            .to_string()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    GetChunk,
    GetAnalysis,
    GetChunksForTime,
    GetAnalysisForTime,
}

impl FromStr for ClientAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get_chunk" => Ok(ClientAction::GetChunk),
            "get_analysis" => Ok(ClientAction::GetAnalysis),
            "get_chunks_for_time" => Ok(ClientAction::GetChunksForTime),
            "get_analysis_for_time" => Ok(ClientAction::GetAnalysisForTime),
            other => Err(format!("Unknown action: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    pub action: String,
    #[serde(default)]
    pub current_time: Option<f64>,
    #[serde(default)]
    pub buffer_ahead: Option<f64>,
}

/// What the connection handler should do with one client message.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPlan {
    /// Wait (bounded) for the next record on the chunk queue.
    PullChunk,
    /// Wait (bounded) for the next report on the analysis queue.
    PullAnalysis,
    /// Answer immediately, in this order.
    Reply(Vec<StreamMessage>),
}

impl RequestPlan {
    fn reply(message: StreamMessage) -> Self {
        RequestPlan::Reply(vec![message])
    }
}

/// Decode a client message and work out the answer. Malformed requests get an
/// `error` reply; none of them end the connection.
pub fn plan_request(session: &StreamSession, text: &str) -> RequestPlan {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(err) => return RequestPlan::reply(StreamMessage::error(format!("Invalid request: {}", err))),
    };

    let action = match request.action.parse::<ClientAction>() {
        Ok(action) => action,
        Err(message) => return RequestPlan::reply(StreamMessage::error(message)),
    };

    match action {
        ClientAction::GetChunk => RequestPlan::PullChunk,
        ClientAction::GetAnalysis => RequestPlan::PullAnalysis,
        ClientAction::GetChunksForTime => {
            let current_time = match required_time(&request) {
                Ok(time) => time,
                Err(reply) => return RequestPlan::reply(reply),
            };
            let buffer_ahead = request.buffer_ahead.unwrap_or(DEFAULT_BUFFER_AHEAD);
            if !buffer_ahead.is_finite() || buffer_ahead < 0.0 {
                return RequestPlan::reply(StreamMessage::error(
                    "buffer_ahead must be a non-negative number",
                ));
            }

            // One chunk_data per record, oldest first; an empty window answers with status.
            let chunks = session
                .history()
                .in_time_range(current_time, current_time + buffer_ahead);
            if chunks.is_empty() {
                return RequestPlan::reply(StreamMessage::Status(session.snapshot()));
            }
            RequestPlan::Reply(chunks.into_iter().map(StreamMessage::ChunkData).collect())
        }
        ClientAction::GetAnalysisForTime => match required_time(&request) {
            Ok(time) => RequestPlan::reply(StreamMessage::AudioAnalysis(
                session.reports().nearest(time),
            )),
            Err(reply) => RequestPlan::reply(reply),
        },
    }
}

fn required_time(request: &ClientRequest) -> Result<f64, StreamMessage> {
    match request.current_time {
        Some(time) if time.is_finite() => Ok(time),
        Some(_) => Err(StreamMessage::error("current_time must be a finite number")),
        None => Err(StreamMessage::error(format!(
            "current_time is required for {}",
            request.action
        ))),
    }
}

/// Next record, or the session status when the stream ended or nothing arrived in time.
pub async fn pull_chunk(session: &StreamSession, timeout: Duration) -> StreamMessage {
    match session.chunk_queue().pop_timeout(timeout).await {
        Dequeued::Item(record) => StreamMessage::ChunkData(record),
        Dequeued::EndOfStream | Dequeued::Empty => StreamMessage::Status(session.snapshot()),
    }
}

/// Next report, or the session status when the stream ended or nothing arrived in time.
pub async fn pull_analysis(session: &StreamSession, timeout: Duration) -> StreamMessage {
    match session.analysis_queue().pop_timeout(timeout).await {
        Dequeued::Item(report) => StreamMessage::AudioAnalysis(Some(report)),
        Dequeued::EndOfStream | Dequeued::Empty => StreamMessage::Status(session.snapshot()),
    }
}

/// Take whatever is queued right now, at most `limit` records and `limit` reports.
pub fn drain_ready(session: &StreamSession, limit: usize) -> Vec<StreamMessage> {
    let mut messages = Vec::new();

    for _ in 0..limit {
        match session.chunk_queue().try_pop() {
            Dequeued::Item(record) => messages.push(StreamMessage::ChunkData(record)),
            Dequeued::EndOfStream | Dequeued::Empty => break,
        }
    }
    for _ in 0..limit {
        match session.analysis_queue().try_pop() {
            Dequeued::Item(report) => messages.push(StreamMessage::AudioAnalysis(Some(report))),
            Dequeued::EndOfStream | Dequeued::Empty => break,
        }
    }

    messages
}

/// Production finished and both queues are down to their end markers.
pub fn stream_exhausted(session: &StreamSession) -> bool {
    session.chunk_queue().is_drained() && session.analysis_queue().is_drained()
}
