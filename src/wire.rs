//! Line-delimited JSON bridge. Each line is one [`ClientMessage`] or
//! [`ServerMessage`]; the first client line must authenticate.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::{MAX_BATCHES_WATCHED_PER_CONNECTION, MAX_WIRE_LINE_LEN};
use crate::model::*;
use crate::notify::{BatchEvent, DeliveryFilter};
use crate::observability;
use crate::scheduler::Scheduler;

const OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        password: String,
    },
    Schedule {
        movie_id: Ulid,
        theater_ids: Vec<Ulid>,
        duration_minutes: u32,
        start_times: Vec<Ms>,
    },
    /// Reply once the batch is terminal.
    Await {
        batch_id: Ulid,
    },
    /// Stream events for one batch, or for all batches when omitted.
    Subscribe {
        #[serde(default)]
        batch_id: Option<Ulid>,
    },
    Showtimes {
        batch_id: Ulid,
    },
    Tickets {
        showtime_id: Ulid,
    },
    Status {
        batch_id: Ulid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready,
    Accepted { batch_id: Ulid },
    Outcome { event: BatchEvent },
    Subscribed { batch_id: Option<Ulid> },
    Event { event: BatchEvent },
    Showtimes { batch_id: Ulid, showtimes: Vec<Showtime> },
    Tickets { showtime_id: Ulid, tickets: Vec<Ticket> },
    Status { batch_id: Ulid, state: Option<BatchState> },
    Error { message: String },
}

impl ServerMessage {
    fn error(message: impl std::fmt::Display) -> Self {
        ServerMessage::Error {
            message: message.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum WireError {
    Io(std::io::Error),
    LineTooLong,
    Json(serde_json::Error),
    AuthFailed,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Io(e) => write!(f, "io error: {e}"),
            WireError::LineTooLong => write!(f, "line exceeds {MAX_WIRE_LINE_LEN} bytes"),
            WireError::Json(e) => write!(f, "invalid JSON: {e}"),
            WireError::AuthFailed => write!(f, "authentication failed"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io(e)
    }
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        WireError::Json(e)
    }
}

impl From<LinesCodecError> for WireError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => WireError::LineTooLong,
            LinesCodecError::Io(e) => WireError::Io(e),
        }
    }
}

/// A decoded line. Malformed JSON is reported in-band so one bad line does
/// not end the stream.
#[derive(Debug)]
pub enum Decoded<T> {
    Message(T),
    Malformed(String),
}

/// JSON-per-line codec reading `In` and writing `Out`.
pub struct JsonLines<In, Out> {
    lines: LinesCodec,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> Default for JsonLines<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> JsonLines<In, Out> {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_WIRE_LINE_LEN),
            _marker: PhantomData,
        }
    }

    fn parse(line: Option<String>) -> Option<Decoded<In>>
    where
        In: DeserializeOwned,
    {
        let line = line?;
        Some(match serde_json::from_str(&line) {
            Ok(msg) => Decoded::Message(msg),
            Err(e) => Decoded::Malformed(e.to_string()),
        })
    }
}

impl<In: DeserializeOwned, Out> Decoder for JsonLines<In, Out> {
    type Item = Decoded<In>;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, WireError> {
        loop {
            match self.lines.decode(src)? {
                Some(line) if line.trim().is_empty() => continue,
                line => return Ok(Self::parse(line)),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, WireError> {
        loop {
            match self.lines.decode_eof(src)? {
                Some(line) if line.trim().is_empty() => continue,
                line => return Ok(Self::parse(line)),
            }
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for JsonLines<In, Out> {
    type Error = WireError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), WireError> {
        let line = serde_json::to_vec(&item)?;
        dst.reserve(line.len() + 1);
        dst.put_slice(&line);
        dst.put_u8(b'\n');
        Ok(())
    }
}

pub type ServerCodec = JsonLines<ClientMessage, ServerMessage>;
pub type ClientCodec = JsonLines<ServerMessage, ClientMessage>;

/// Serve one client until it disconnects.
pub async fn process_connection<S>(
    socket: S,
    scheduler: Arc<Scheduler>,
    password: String,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, ServerCodec::new());

    match framed.next().await {
        None => return Ok(()),
        Some(Err(e)) => return Err(e),
        Some(Ok(Decoded::Message(ClientMessage::Auth { password: given }))) if given == password => {
            framed.send(ServerMessage::Ready).await?;
        }
        Some(Ok(_)) => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            framed.send(ServerMessage::error(WireError::AuthFailed)).await?;
            return Err(WireError::AuthFailed);
        }
    }

    let mut session = Session::new(scheduler);
    let result = session.run(&mut framed).await;
    session.shutdown().await;
    result
}

/// Per-connection state: background tasks feeding the outbox, the batch
/// channels they listen on, and the duplicate filter for streamed events.
struct Session {
    scheduler: Arc<Scheduler>,
    outbox_tx: mpsc::Sender<ServerMessage>,
    outbox_rx: mpsc::Receiver<ServerMessage>,
    filter: DeliveryFilter,
    tasks: Vec<JoinHandle<()>>,
    /// Batch channels opened by `await` or `subscribe`, released on close.
    watched: HashSet<Ulid>,
}

impl Session {
    fn new(scheduler: Arc<Scheduler>) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        Self {
            scheduler,
            outbox_tx,
            outbox_rx,
            filter: DeliveryFilter::new(),
            tasks: Vec::new(),
            watched: HashSet::new(),
        }
    }

    async fn run<S>(&mut self, framed: &mut Framed<S, ServerCodec>) -> Result<(), WireError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                frame = framed.next() => {
                    let replies = match frame {
                        None => return Ok(()),
                        Some(Err(WireError::LineTooLong)) => {
                            framed.send(ServerMessage::error(WireError::LineTooLong)).await?;
                            return Err(WireError::LineTooLong);
                        }
                        Some(Err(e)) => return Err(e),
                        Some(Ok(Decoded::Malformed(e))) => vec![ServerMessage::error(format!("invalid message: {e}"))],
                        Some(Ok(Decoded::Message(msg))) => self.handle(msg).await,
                    };
                    for reply in replies {
                        self.deliver(framed, reply).await?;
                    }
                }
                Some(msg) = self.outbox_rx.recv() => {
                    self.deliver(framed, msg).await?;
                }
            }
        }
    }

    /// Send one message, dropping streamed events this client already saw.
    async fn deliver<S>(
        &mut self,
        framed: &mut Framed<S, ServerCodec>,
        msg: ServerMessage,
    ) -> Result<(), WireError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let ServerMessage::Event { event } = &msg
            && !self.filter.admit(event)
        {
            return Ok(());
        }
        framed.send(msg).await
    }

    /// Track a batch channel this connection listens on. False once the
    /// connection is watching too many.
    fn watch(&mut self, batch_id: Ulid) -> bool {
        if self.watched.contains(&batch_id) {
            return true;
        }
        if self.watched.len() >= MAX_BATCHES_WATCHED_PER_CONNECTION {
            return false;
        }
        self.watched.insert(batch_id)
    }

    /// Immediate replies, in order. `await` and `subscribe` also answer
    /// later through the outbox, which only background tasks write to.
    async fn handle(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::Auth { .. } => vec![ServerMessage::error("already authenticated")],
            ClientMessage::Schedule {
                movie_id,
                theater_ids,
                duration_minutes,
                start_times,
            } => vec![
                match self
                    .scheduler
                    .request_batch(movie_id, theater_ids, duration_minutes, start_times)
                    .await
                {
                    Ok(batch_id) => ServerMessage::Accepted { batch_id },
                    Err(e) => ServerMessage::error(e),
                },
            ],
            ClientMessage::Await { batch_id } => {
                if !self.watch(batch_id) {
                    return vec![too_many_watched()];
                }
                let scheduler = self.scheduler.clone();
                let outbox = self.outbox_tx.clone();
                self.tasks.push(tokio::spawn(async move {
                    let reply = match scheduler.await_outcome(batch_id).await {
                        Ok(outcome) => ServerMessage::Outcome {
                            event: BatchEvent::from_outcome(batch_id, outcome),
                        },
                        Err(e) => ServerMessage::error(e),
                    };
                    let _ = outbox.send(reply).await;
                }));
                vec![]
            }
            ClientMessage::Subscribe { batch_id: None } => {
                let rx = self.scheduler.subscribe_all();
                self.tasks.push(tokio::spawn(forward_events(rx, self.outbox_tx.clone())));
                vec![ServerMessage::Subscribed { batch_id: None }]
            }
            ClientMessage::Subscribe { batch_id: Some(id) } => {
                if !self.watch(id) {
                    return vec![too_many_watched()];
                }
                let rx = self.scheduler.subscribe(id);
                self.tasks.push(tokio::spawn(forward_events(rx, self.outbox_tx.clone())));
                let mut replies = vec![ServerMessage::Subscribed { batch_id: Some(id) }];
                // A batch that settled before the subscription still gets its
                // terminal event; the filter drops any repeat.
                if let Some(outcome) = self.scheduler.engine().batch(&id).and_then(|r| r.outcome) {
                    replies.push(ServerMessage::Event {
                        event: BatchEvent::from_outcome(id, outcome),
                    });
                }
                replies
            }
            ClientMessage::Showtimes { batch_id } => vec![ServerMessage::Showtimes {
                batch_id,
                showtimes: self.scheduler.find_showtimes_by_batch_id(&batch_id),
            }],
            ClientMessage::Tickets { showtime_id } => vec![ServerMessage::Tickets {
                showtime_id,
                tickets: self.scheduler.tickets_for_showtime(&showtime_id),
            }],
            ClientMessage::Status { batch_id } => vec![ServerMessage::Status {
                batch_id,
                state: self.scheduler.batch_state(&batch_id),
            }],
        }
    }

    /// Stop the background tasks, wait for them to drop their receivers,
    /// then give back the batch channels nobody else listens on.
    async fn shutdown(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        let bus = self.scheduler.bus();
        for batch_id in self.watched.drain() {
            bus.release(&batch_id);
        }
    }
}

fn too_many_watched() -> ServerMessage {
    ServerMessage::error(format!(
        "at most {MAX_BATCHES_WATCHED_PER_CONNECTION} batches watched per connection"
    ))
}

async fn forward_events(
    mut rx: broadcast::Receiver<BatchEvent>,
    outbox: mpsc::Sender<ServerMessage>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if outbox.send(ServerMessage::Event { event }).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("subscriber lagged, {n} events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("event forwarder stopped");
}
