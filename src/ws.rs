//! One WebSocket viewer session.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use frame_source::Frame;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::media::{run_send_loop, Consumer, FrameSink, SupervisorHandle};
use crate::redirect::{redirect_payload, Admission};

/// Lifecycle of a viewer session. `Closed` is reachable from every phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Redirected,
    Admitted,
    Streaming,
    Closed,
}

/// What every viewer session needs from the broadcast node.
#[derive(Clone)]
pub struct SessionSettings {
    pub supervisor: SupervisorHandle,
    pub queue_capacity: usize,
    pub max_session: Option<Duration>,
}

struct Session {
    client: String,
    phase: SessionPhase,
}

impl Session {
    fn enter(&mut self, next: SessionPhase) {
        log::debug!("ws {}: {:?} -> {:?}", self.client, self.phase, next);
        self.phase = next;
    }
}

/// Frames go out as binary messages.
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Frame) -> anyhow::Result<()> {
        self.inner.send(Message::Binary(frame.into_bytes())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            log::debug!("ws: close failed: {}", e);
        }
    }
}

/// Runs a viewer session to completion.
pub async fn serve_socket(
    mut socket: WebSocket,
    client: String,
    admission: Admission,
    settings: SessionSettings,
) {
    let mut session = Session {
        client,
        phase: SessionPhase::Connecting,
    };

    if let Admission::Redirect(url) = admission {
        session.enter(SessionPhase::Redirected);
        let payload = redirect_payload(&url);
        if let Err(e) = socket.send(Message::Text(payload.into())).await {
            log::info!("ws {}: redirect not delivered: {}", session.client, e);
        }
        if let Err(e) = socket.send(Message::Close(None)).await {
            log::debug!("ws {}: close after redirect failed: {}", session.client, e);
        }
        session.enter(SessionPhase::Closed);
        return;
    }

    let (sink, stream) = socket.split();
    let (consumer, receiver) =
        Consumer::new(format!("ws {}", session.client), settings.queue_capacity);
    tokio::spawn(watch_client(stream, consumer.cancel_token()));

    if let Err(e) = settings.supervisor.admit(consumer.clone()).await {
        log::warn!("ws {}: not admitted: {:#}", session.client, e);
        consumer.cancel();
        session.enter(SessionPhase::Closed);
        return;
    }
    session.enter(SessionPhase::Admitted);

    session.enter(SessionPhase::Streaming);
    let exit = run_send_loop(receiver, WsSink { inner: sink }, settings.max_session).await;
    log::info!("ws {}: session ended: {:?}", session.client, exit);
    session.enter(SessionPhase::Closed);
}

/// Viewers never send anything meaningful; a close frame, a read error or
/// the end of the stream ends the session.
async fn watch_client(mut stream: SplitStream<WebSocket>, token: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                log::debug!("ws: read failed: {}", e);
                break;
            }
            Some(Ok(_)) => {}
        }
    }
    token.cancel();
}
