//! Streaming half of the session bridge.
//!
//! One call runs two tasks: the driver (this module's [`StreamCall::run`]),
//! which posts the message and enforces the deadlines, and a listener over
//! the server's `/event` feed, which matches events to our assistant message
//! and forwards text deltas. They meet at a one-shot "message started"
//! handoff and at the listener's exit; the listener is always joined before
//! the terminal chunk is sent and the session deleted.

use futures_util::StreamExt;
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    client::OpenCodeClient,
    events::{Completion, MatchStep, SseDecoder, StreamMatcher},
    session::BackendSession,
    wire::{Event, MessageRequest},
    BridgeTimeouts,
};
use crate::{backend::BackendError, models::ChatCompletionsChunk};

pub type ChunkSender = mpsc::Sender<Result<ChatCompletionsChunk, BackendError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenEnd {
    Completed(Completion),
    FeedClosed,
    Cancelled,
}

/// Chunk identity shared by every chunk of one stream.
#[derive(Debug, Clone)]
struct ChunkFrame {
    id: String,
    created: i64,
    model: String,
}

impl ChunkFrame {
    fn role(&self) -> ChatCompletionsChunk {
        ChatCompletionsChunk::role(&self.id, self.created, &self.model)
    }

    fn delta(&self, content: String) -> ChatCompletionsChunk {
        ChatCompletionsChunk::delta(&self.id, self.created, &self.model, content)
    }

    fn finish(&self) -> ChatCompletionsChunk {
        ChatCompletionsChunk::finish(&self.id, self.created, &self.model)
    }
}

pub struct StreamCall {
    pub client: OpenCodeClient,
    pub session: BackendSession,
    pub feed: reqwest::Response,
    pub message: MessageRequest,
    pub created: i64,
    pub model: String,
    pub timeouts: BridgeTimeouts,
    /// Fired when the caller drops the stream or the backend shuts down.
    pub cancel: CancellationToken,
}

impl StreamCall {
    pub async fn run(self, tx: ChunkSender) {
        let StreamCall {
            client,
            session,
            feed,
            message,
            created,
            model,
            timeouts,
            cancel,
        } = self;
        let session_id = session.id().to_owned();
        let frame = ChunkFrame {
            id: format!("chatcmpl-{session_id}"),
            created,
            model,
        };

        let _ = tx.send(Ok(frame.role())).await;

        let listener_cancel = cancel.child_token();
        let listener_done = CancellationToken::new();
        let (started_tx, started_rx) = oneshot::channel();
        let listener = tokio::spawn(listen(Listener {
            feed,
            session_id: session_id.clone(),
            frame: frame.clone(),
            tx: tx.clone(),
            started: started_tx,
            cancel: listener_cancel.clone(),
            done: listener_done.clone(),
        }));

        let driven = drive(
            &client,
            &session_id,
            &message,
            started_rx,
            &listener_done,
            &timeouts,
            &cancel,
        )
        .await;

        listener_cancel.cancel();
        let listened = match listener.await {
            Ok(result) => result,
            Err(error) => Err(BackendError::Protocol(format!("event listener failed: {error}"))),
        };

        let outcome = match (driven, listened) {
            (Ok(()), Ok(end)) => {
                info!(session_id = %session_id, end = ?end, "stream completed");
                Ok(())
            }
            (Ok(()), Err(error)) => Err(error),
            (Err(Interrupt::ListenerExited), Err(error)) => Err(error),
            (Err(interrupt), _) => Err(interrupt.into_error()),
        };

        // Sends fail silently once the caller has dropped the stream.
        if tx.is_closed() {
            debug!(session_id = %session_id, "stream abandoned by caller");
        } else {
            let _ = tx.send(Ok(frame.finish())).await;
            if let Err(error) = outcome {
                warn!(session_id = %session_id, error = %error, "stream ended with error");
                let _ = tx.send(Err(error)).await;
            }
        }

        session.close().await;
    }
}

#[derive(Debug)]
enum Interrupt {
    Failed(BackendError),
    ListenerExited,
    Cancelled,
}

impl Interrupt {
    fn into_error(self) -> BackendError {
        match self {
            Self::Failed(error) => error,
            Self::ListenerExited => BackendError::Protocol(
                "event stream closed before the assistant responded".to_owned(),
            ),
            Self::Cancelled => BackendError::Unavailable("backend is shutting down".to_owned()),
        }
    }
}

/// Posts the message, then waits for the start handoff and for the listener
/// to finish, each under its own deadline.
async fn drive(
    client: &OpenCodeClient,
    session_id: &str,
    message: &MessageRequest,
    started: oneshot::Receiver<String>,
    listener_done: &CancellationToken,
    timeouts: &BridgeTimeouts,
    cancel: &CancellationToken,
) -> Result<(), Interrupt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
        posted = client.post_message(session_id, message) => {
            posted.map_err(|error| Interrupt::Failed(error.context("failed to send message")))?;
        }
    }

    // A handoff that is already waiting beats a timer firing in the same poll.
    tokio::select! {
        biased;
        started = started => match started {
            Ok(message_id) => debug!(session_id = %session_id, message_id = %message_id, "assistant started responding"),
            Err(_) => return Err(Interrupt::ListenerExited),
        },
        _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
        _ = sleep(timeouts.start) => {
            return Err(Interrupt::Failed(BackendError::Timeout(
                "timeout waiting for message to start".to_owned(),
            )))
        }
    }

    tokio::select! {
        biased;
        _ = listener_done.cancelled() => Ok(()),
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = sleep(timeouts.stream) => {
            Err(Interrupt::Failed(BackendError::Timeout("streaming timeout".to_owned())))
        }
    }
}

struct Listener {
    feed: reqwest::Response,
    session_id: String,
    frame: ChunkFrame,
    tx: ChunkSender,
    started: oneshot::Sender<String>,
    cancel: CancellationToken,
    /// Fired on every exit path of the listener, including panics.
    done: CancellationToken,
}

async fn listen(listener: Listener) -> Result<ListenEnd, BackendError> {
    let Listener {
        feed,
        session_id,
        frame,
        tx,
        started,
        cancel,
        done,
    } = listener;
    let _done = done.drop_guard();
    let mut started = Some(started);
    let mut bytes = feed.bytes_stream();
    let mut decoder = SseDecoder::default();
    let mut matcher = StreamMatcher::new(session_id.as_str());

    debug!(session_id = %session_id, "event listener started");
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ListenEnd::Cancelled),
            next = bytes.next() => next,
        };

        let (payloads, feed_ended) = match next {
            Some(Ok(chunk)) => (decoder.push(&chunk), false),
            Some(Err(error)) => {
                return Err(BackendError::Unavailable(format!(
                    "error reading event stream: {error}"
                )))
            }
            None => (decoder.finish(), true),
        };

        for payload in payloads {
            let event = match serde_json::from_str::<Event>(&payload) {
                Ok(event) => event,
                Err(error) => {
                    debug!(session_id = %session_id, error = %error, "skipping undecodable event");
                    continue;
                }
            };

            for step in matcher.observe(&event) {
                match step {
                    MatchStep::Started(message_id) => {
                        if let Some(started) = started.take() {
                            let _ = started.send(message_id);
                        }
                    }
                    MatchStep::Delta(content) => {
                        let sent = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Ok(ListenEnd::Cancelled),
                            sent = tx.send(Ok(frame.delta(content))) => sent,
                        };
                        if sent.is_err() {
                            return Ok(ListenEnd::Cancelled);
                        }
                    }
                    MatchStep::Finished(completion) => {
                        debug!(session_id = %session_id, completion = ?completion, "assistant message finished");
                        return Ok(ListenEnd::Completed(completion));
                    }
                }
            }
        }

        if feed_ended {
            debug!(session_id = %session_id, "event feed closed");
            return Ok(ListenEnd::FeedClosed);
        }
    }
}
