//! Boundary with the container-building muxer task. The container tree
//! itself is built by the collaborator behind these channels; this crate
//! only defines the message contract and how the task is attached.

use bytes::Bytes;

use crate::metadata::{StreamMetadata, StreamOptions};

pub type MuxerInputSender = tokio::sync::mpsc::Sender<MuxerInput>;
pub type MuxerInputReceiver = tokio::sync::mpsc::Receiver<MuxerInput>;
pub type MuxerEventSender = tokio::sync::mpsc::Sender<MuxerEvent>;
pub type MuxerEventReceiver = tokio::sync::mpsc::Receiver<MuxerEvent>;

/// Messages from the coordinator to the muxer task.
#[derive(Clone, Debug)]
pub enum MuxerInput {
    Start {
        metadata: StreamMetadata,
        options: StreamOptions,
    },
    /// One wire segment (metadata header or chunk framing). One message per
    /// segment; the muxer must not concatenate across messages.
    StreamData(Bytes),
    End,
}

/// Messages from the muxer task back to the coordinator.
#[derive(Clone, Debug)]
pub enum MuxerEvent {
    Ready,
    /// Stream-open acknowledged; chunk data may follow.
    StartStream,
    /// Produced container bytes, ownership transferred upstream.
    MuxedData(Bytes),
    /// Task finished with a numeric status (0 = success).
    Exit(i32),
}

/// Both channel ends of a spawned muxer task, seen from the coordinator.
pub struct MuxerLink {
    pub input: MuxerInputSender,
    pub events: MuxerEventReceiver,
}

/// Spawns the muxer collaborator task and hands back its channels. The
/// coordinator calls this once per stream start.
pub trait MuxerSpawner: Send + Sync + 'static {
    fn spawn(&self) -> MuxerLink;
}

impl<F> MuxerSpawner for F
where
    F: Fn() -> MuxerLink + Send + Sync + 'static,
{
    fn spawn(&self) -> MuxerLink {
        (self)()
    }
}
