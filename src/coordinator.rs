//! Pipeline lifecycle controller.
//!
//! One `Coordinator` drives one stream: it spawns the muxer task on start,
//! forwards configuration, serializes the stream-open header, routes audio
//! through the timeline synchronizer and queue, frames chunks for the muxer
//! and relays muxer output upstream. All message handling runs on a single
//! sequential loop, so the timeline state has exactly one writer.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::{
    chunk::{ChunkCmd, ChunkReceiver, ChunkSender, EncodedChunk},
    metadata::{metadata_segments, StreamMetadata, StreamOptions},
    muxer::{MuxerEvent, MuxerInput, MuxerInputSender, MuxerLink, MuxerSpawner},
    protocol,
    queue::AudioQueue,
    sync::TimelineState,
};

/// Events relayed unchanged to the lifecycle driver (UI / persistence side).
#[derive(Clone, Debug)]
pub enum StreamEvent {
    /// Stream open acknowledged; producers may start sending chunks.
    StartStream,
    /// Container bytes produced by the muxer.
    MuxedData(Bytes),
    /// Muxer finished with a numeric status.
    Exit(i32),
    Error(String),
}

pub type StreamEventReceiver = tokio::sync::broadcast::Receiver<StreamEvent>;

pub type StreamEventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Configuring,
    Streaming,
    Draining,
    Terminated,
}

pub struct Coordinator {
    cancel: CancellationToken,
    tx: tokio::sync::mpsc::Sender<CoordinatorCmd>,
    chunk_tx: ChunkSender,
    events: tokio::sync::broadcast::Sender<StreamEvent>,
}

impl Coordinator {
    pub fn new(id: &str, spawner: impl MuxerSpawner) -> Self {
        let id = id.to_string();
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::mpsc::channel(1024);
        let (chunk_tx, chunk_rx) = tokio::sync::mpsc::channel(1024);
        let (events, _) = tokio::sync::broadcast::channel(1024);

        let cancel_clone = cancel.clone();
        let tx_clone = tx.clone();
        let events_clone = events.clone();
        tokio::spawn(async move {
            Self::inner_loop(
                cancel_clone,
                tx_clone,
                rx,
                chunk_rx,
                events_clone,
                Box::new(spawner),
                id,
            )
            .await
        });

        Self {
            cancel,
            tx,
            chunk_tx,
            events,
        }
    }

    /// Sender handed to encoder tasks; messages from one producer arrive in
    /// send order.
    pub fn producer_sender(&self) -> ChunkSender {
        self.chunk_tx.clone()
    }

    pub fn subscribe(&self) -> StreamEventReceiver {
        self.events.subscribe()
    }

    /// Upstream events as a stream; a lagged subscriber skips ahead.
    pub fn event_stream(&self) -> StreamEventStream {
        Box::pin(
            BroadcastStream::new(self.events.subscribe()).filter_map(|r| async move { r.ok() }),
        )
    }

    /// Starts the stream: validates metadata, spawns the muxer task and
    /// begins the open handshake. Fails if a stream is already active.
    pub async fn start(
        &self,
        metadata: StreamMetadata,
        options: StreamOptions,
    ) -> anyhow::Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(CoordinatorCmd::Start {
                metadata,
                options,
                result: tx,
            })
            .await?;
        rx.await?
    }

    /// Requests stream end: forces a final audio flush and finalizes the
    /// muxer once every active producer has exited.
    pub async fn end(&self) -> anyhow::Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx.send(CoordinatorCmd::End { result: tx }).await?;
        rx.await?
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn inner_loop(
        cancel: CancellationToken,
        tx: tokio::sync::mpsc::Sender<CoordinatorCmd>,
        mut rx: tokio::sync::mpsc::Receiver<CoordinatorCmd>,
        mut chunk_rx: ChunkReceiver,
        events: tokio::sync::broadcast::Sender<StreamEvent>,
        spawner: Box<dyn MuxerSpawner>,
        id: String,
    ) {
        let mut state = CoordinatorState::new(id, tx, events, spawner);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                Some(cmd) = rx.recv() => {
                    if let Err(e) = Self::inner_command_handler(&mut state, cmd).await {
                        log::error!("inner_command_handler error: {:#?}", e);
                    }
                },
                Some(cmd) = chunk_rx.recv() => {
                    if let Err(e) = Self::inner_chunk_handler(&mut state, cmd).await {
                        log::error!("inner_chunk_handler error: {:#?}", e);
                    }
                },
                else => break,
            }
        }
    }

    async fn inner_command_handler(
        state: &mut CoordinatorState,
        cmd: CoordinatorCmd,
    ) -> anyhow::Result<()> {
        match cmd {
            CoordinatorCmd::Start {
                metadata,
                options,
                result,
            } => {
                if state.state != PipelineState::Idle {
                    let _ = result.send(Err(anyhow::anyhow!(
                        "stream already active in state {:?}",
                        state.state
                    )));
                    return Ok(());
                }
                if let Err(e) = metadata.validate() {
                    let msg = format!("{:#}", e);
                    let _ = state.events.send(StreamEvent::Error(msg.clone()));
                    let _ = result.send(Err(anyhow::anyhow!("{}", msg)));
                    return Ok(());
                }

                state.timeline = TimelineState::new(&options);
                state.queue = AudioQueue::new();
                state.pending_exits =
                    usize::from(metadata.audio.is_some()) + usize::from(metadata.video);
                state.end_requested = false;
                state.end_sent = false;
                state.metadata = Some(metadata);
                state.options = options;

                let MuxerLink { input, mut events } = state.spawner.spawn();
                state.muxer_input = Some(input);

                // Forward muxer events into the sequential loop so all
                // handling stays single-threaded.
                let tx = state.tx.clone();
                tokio::spawn(async move {
                    while let Some(ev) = events.recv().await {
                        if tx.send(CoordinatorCmd::Muxer(ev)).await.is_err() {
                            break;
                        }
                    }
                });

                state.state = PipelineState::Configuring;
                log::info!("{}: muxer spawned, configuring", state.id);
                let _ = result.send(Ok(()));
            }
            CoordinatorCmd::End { result } => {
                match state.state {
                    PipelineState::Configuring => {
                        // Stream open not acknowledged yet; drain once the
                        // metadata block has gone out.
                        state.end_requested = true;
                        let _ = result.send(Ok(()));
                    }
                    PipelineState::Streaming => {
                        state.end_requested = true;
                        state.state = PipelineState::Draining;
                        log::info!("{}: draining", state.id);
                        let video = state.video();
                        let chunks = state.queue.flush_end(&mut state.timeline, video);
                        Self::emit_chunks(state, chunks).await?;
                        Self::try_finalize(state).await?;
                        let _ = result.send(Ok(()));
                    }
                    PipelineState::Draining => {
                        let _ = result.send(Ok(()));
                    }
                    PipelineState::Idle | PipelineState::Terminated => {
                        let _ = result.send(Err(anyhow::anyhow!(
                            "no active stream in state {:?}",
                            state.state
                        )));
                    }
                }
            }
            CoordinatorCmd::Muxer(ev) => {
                Self::inner_muxer_handler(state, ev).await?;
            }
        }

        Ok(())
    }

    async fn inner_chunk_handler(
        state: &mut CoordinatorState,
        cmd: ChunkCmd,
    ) -> anyhow::Result<()> {
        match cmd {
            ChunkCmd::Audio(mut chunk) => {
                match state.state {
                    PipelineState::Configuring | PipelineState::Streaming => {}
                    other => {
                        log::debug!("{}: dropping audio chunk in state {:?}", state.id, other);
                        return Ok(());
                    }
                }
                let has_audio = state
                    .metadata
                    .as_ref()
                    .is_some_and(|m| m.audio.is_some());
                if !has_audio {
                    return Ok(());
                }

                state.timeline.ingest_audio(&mut chunk);
                state.queue.push(chunk);

                // Chunks arriving before the stream-open ack stay queued; the
                // metadata block must reach the muxer first.
                if state.state == PipelineState::Streaming {
                    let video = state.video();
                    let limit = state.options.audio_queue_limit;
                    let chunks = state.queue.flush(&mut state.timeline, video, limit);
                    Self::emit_chunks(state, chunks).await?;
                }
            }
            ChunkCmd::Video(mut chunk) => {
                if state.state != PipelineState::Streaming {
                    log::debug!(
                        "{}: dropping video chunk in state {:?}",
                        state.id,
                        state.state
                    );
                    return Ok(());
                }
                if !state.video() {
                    return Ok(());
                }
                // Cluster cadence on video is the producer's call; only the
                // monotonicity clamp applies here.
                state.timeline.finalize(&mut chunk);
                Self::send_chunk(state, &chunk).await?;
            }
            ChunkCmd::Error(detail) => {
                log::error!("{}: producer error: {}", state.id, detail);
                let _ = state.events.send(StreamEvent::Error(detail));
            }
            ChunkCmd::Exit => {
                state.pending_exits = state.pending_exits.saturating_sub(1);
                log::info!(
                    "{}: producer exited, {} still active",
                    state.id,
                    state.pending_exits
                );
                Self::try_finalize(state).await?;
            }
        }

        Ok(())
    }

    async fn inner_muxer_handler(
        state: &mut CoordinatorState,
        ev: MuxerEvent,
    ) -> anyhow::Result<()> {
        match ev {
            MuxerEvent::Ready => {
                if state.state != PipelineState::Configuring {
                    log::debug!("{}: ignoring muxer ready in state {:?}", state.id, state.state);
                    return Ok(());
                }
                let Some(metadata) = state.metadata.clone() else {
                    return Ok(());
                };
                let options = state.options.clone();
                let Some(input) = state.muxer_input.as_ref() else {
                    return Ok(());
                };
                input
                    .send(MuxerInput::Start { metadata, options })
                    .await
                    .map_err(|_| anyhow::anyhow!("muxer input channel closed"))?;
            }
            MuxerEvent::StartStream => {
                if state.state != PipelineState::Configuring {
                    log::debug!(
                        "{}: ignoring stream-open ack in state {:?}",
                        state.id,
                        state.state
                    );
                    return Ok(());
                }
                let Some(metadata) = state.metadata.clone() else {
                    return Ok(());
                };
                for segment in metadata_segments(&metadata) {
                    Self::send_segment(state, segment).await?;
                }
                let _ = state.events.send(StreamEvent::StartStream);

                if state.end_requested {
                    state.state = PipelineState::Draining;
                    log::info!("{}: draining", state.id);
                    let chunks = state.queue.flush_end(&mut state.timeline, metadata.video);
                    Self::emit_chunks(state, chunks).await?;
                    Self::try_finalize(state).await?;
                } else {
                    state.state = PipelineState::Streaming;
                    log::info!("{}: streaming", state.id);
                    let limit = state.options.audio_queue_limit;
                    let chunks = state
                        .queue
                        .flush(&mut state.timeline, metadata.video, limit);
                    Self::emit_chunks(state, chunks).await?;
                }
            }
            MuxerEvent::MuxedData(data) => {
                let _ = state.events.send(StreamEvent::MuxedData(data));
            }
            MuxerEvent::Exit(code) => {
                if code != 0 {
                    let _ = state.events.send(StreamEvent::Error(format!(
                        "muxer exited with status {}",
                        code
                    )));
                }
                let _ = state.events.send(StreamEvent::Exit(code));
                state.muxer_input = None;
                state.state = PipelineState::Terminated;
                log::info!("{}: terminated, muxer status {}", state.id, code);
            }
        }

        Ok(())
    }

    /// Sends the muxer `end` once draining has started and every active
    /// producer has exited.
    async fn try_finalize(state: &mut CoordinatorState) -> anyhow::Result<()> {
        if state.state != PipelineState::Draining || state.pending_exits > 0 || state.end_sent {
            return Ok(());
        }
        let Some(input) = state.muxer_input.as_ref() else {
            return Ok(());
        };
        input
            .send(MuxerInput::End)
            .await
            .map_err(|_| anyhow::anyhow!("muxer input channel closed"))?;
        state.end_sent = true;
        log::info!("{}: muxer finalize requested", state.id);
        Ok(())
    }

    async fn emit_chunks(
        state: &CoordinatorState,
        chunks: Vec<EncodedChunk>,
    ) -> anyhow::Result<()> {
        for chunk in &chunks {
            Self::send_chunk(state, chunk).await?;
        }
        Ok(())
    }

    async fn send_chunk(state: &CoordinatorState, chunk: &EncodedChunk) -> anyhow::Result<()> {
        for segment in protocol::chunk_segments(chunk) {
            Self::send_segment(state, segment).await?;
        }
        Ok(())
    }

    async fn send_segment(state: &CoordinatorState, segment: Bytes) -> anyhow::Result<()> {
        let Some(input) = state.muxer_input.as_ref() else {
            anyhow::bail!("muxer not attached");
        };
        input
            .send(MuxerInput::StreamData(segment))
            .await
            .map_err(|_| anyhow::anyhow!("muxer input channel closed"))?;
        Ok(())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CoordinatorState {
    id: String,
    state: PipelineState,
    metadata: Option<StreamMetadata>,
    options: StreamOptions,
    timeline: TimelineState,
    queue: AudioQueue,
    muxer_input: Option<MuxerInputSender>,
    /// Producers still expected to send `exit` (one per configured kind).
    pending_exits: usize,
    end_requested: bool,
    end_sent: bool,
    tx: tokio::sync::mpsc::Sender<CoordinatorCmd>,
    events: tokio::sync::broadcast::Sender<StreamEvent>,
    spawner: Box<dyn MuxerSpawner>,
}

impl CoordinatorState {
    fn new(
        id: String,
        tx: tokio::sync::mpsc::Sender<CoordinatorCmd>,
        events: tokio::sync::broadcast::Sender<StreamEvent>,
        spawner: Box<dyn MuxerSpawner>,
    ) -> Self {
        Self {
            id,
            state: PipelineState::Idle,
            metadata: None,
            options: StreamOptions::default(),
            timeline: TimelineState::new(&StreamOptions::default()),
            queue: AudioQueue::new(),
            muxer_input: None,
            pending_exits: 0,
            end_requested: false,
            end_sent: false,
            tx,
            events,
            spawner,
        }
    }

    fn video(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.video)
    }
}

enum CoordinatorCmd {
    Start {
        metadata: StreamMetadata,
        options: StreamOptions,
        result: tokio::sync::oneshot::Sender<anyhow::Result<()>>,
    },
    End {
        result: tokio::sync::oneshot::Sender<anyhow::Result<()>>,
    },
    Muxer(MuxerEvent),
}

#[cfg(test)]
#[path = "coordinator_test.rs"]
mod coordinator_test;
