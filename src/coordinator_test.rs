use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;

use crate::chunk::{ChunkCmd, EncodedChunk};
use crate::coordinator::{Coordinator, StreamEvent, StreamEventReceiver};
use crate::metadata::{AudioMetadata, StreamMetadata, StreamOptions};
use crate::muxer::{
    MuxerEvent, MuxerEventSender, MuxerInput, MuxerInputReceiver, MuxerLink,
};
use crate::protocol::{decode_flags, decode_u64};

/// Scriptable muxer stub: the spawner hands the task-side channel ends back
/// to the test so it can play the muxer role step by step.
fn test_muxer() -> (
    impl Fn() -> MuxerLink + Send + Sync + 'static,
    tokio::sync::mpsc::Receiver<(MuxerInputReceiver, MuxerEventSender)>,
) {
    let (handle_tx, handle_rx) = tokio::sync::mpsc::channel(1);
    let spawner = move || {
        let (input_tx, input_rx) = tokio::sync::mpsc::channel(1024);
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(1024);
        let _ = handle_tx.try_send((input_rx, event_tx));
        MuxerLink {
            input: input_tx,
            events: event_rx,
        }
    };
    (spawner, handle_rx)
}

fn opus_metadata() -> StreamMetadata {
    StreamMetadata::audio_only(AudioMetadata::opus(48_000, 2))
}

async fn recv_input(rx: &mut MuxerInputReceiver) -> anyhow::Result<MuxerInput> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for muxer input"))?
        .ok_or_else(|| anyhow::anyhow!("muxer input channel closed"))
}

async fn recv_segment(rx: &mut MuxerInputReceiver) -> anyhow::Result<Bytes> {
    match recv_input(rx).await? {
        MuxerInput::StreamData(data) => Ok(data),
        other => Err(anyhow::anyhow!("expected stream data, got {:?}", other)),
    }
}

async fn recv_event(rx: &mut StreamEventReceiver) -> anyhow::Result<StreamEvent> {
    Ok(tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for stream event"))??)
}

/// Drives the open handshake through to Streaming and consumes the metadata
/// block, returning the live pieces.
async fn open_stream(
    metadata: StreamMetadata,
    options: StreamOptions,
) -> anyhow::Result<(
    Coordinator,
    StreamEventReceiver,
    MuxerInputReceiver,
    MuxerEventSender,
)> {
    let (spawner, mut handle_rx) = test_muxer();
    let coordinator = Coordinator::new("test", spawner);
    let mut events = coordinator.subscribe();
    let metadata_segments = crate::metadata::metadata_segments(&metadata).len();
    coordinator.start(metadata, options).await?;

    let (mut muxer_in, muxer_events) = handle_rx
        .recv()
        .await
        .ok_or_else(|| anyhow::anyhow!("muxer was not spawned"))?;

    muxer_events.send(MuxerEvent::Ready).await?;
    match recv_input(&mut muxer_in).await? {
        MuxerInput::Start { .. } => {}
        other => anyhow::bail!("expected start after ready, got {:?}", other),
    }

    muxer_events.send(MuxerEvent::StartStream).await?;
    for _ in 0..metadata_segments {
        recv_segment(&mut muxer_in).await?;
    }
    match recv_event(&mut events).await? {
        StreamEvent::StartStream => {}
        other => anyhow::bail!("expected start-stream event, got {:?}", other),
    }

    Ok((coordinator, events, muxer_in, muxer_events))
}

#[tokio::test]
async fn test_open_handshake_sends_config_then_metadata() -> anyhow::Result<()> {
    let (spawner, mut handle_rx) = test_muxer();
    let coordinator = Coordinator::new("test", spawner);
    let mut events = coordinator.subscribe();
    coordinator
        .start(opus_metadata(), StreamOptions::default())
        .await?;

    let (mut muxer_in, muxer_events) = handle_rx
        .recv()
        .await
        .ok_or_else(|| anyhow::anyhow!("muxer was not spawned"))?;

    muxer_events.send(MuxerEvent::Ready).await?;
    match recv_input(&mut muxer_in).await? {
        MuxerInput::Start { metadata, options } => {
            assert!(metadata.audio.is_some());
            assert!(!metadata.video);
            assert_eq!(options.audio_queue_limit, None);
        }
        other => anyhow::bail!("expected start, got {:?}", other),
    }

    muxer_events.send(MuxerEvent::StartStream).await?;

    // eight header segments for an audio stream, codec id in the sixth
    let mut segments = Vec::new();
    for _ in 0..8 {
        segments.push(recv_segment(&mut muxer_in).await?);
    }
    assert_eq!(decode_u64(&segments[0])?, 0);
    assert_eq!(segments[5].as_ref(), b"A_OPUS");
    assert_eq!(segments[6].len(), 19, "OpusHead codec private");

    match recv_event(&mut events).await? {
        StreamEvent::StartStream => {}
        other => anyhow::bail!("expected start-stream event, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_audio_chunks_are_framed_in_order() -> anyhow::Result<()> {
    let (coordinator, _events, mut muxer_in, _muxer_events) =
        open_stream(opus_metadata(), StreamOptions::default()).await?;

    let sender = coordinator.producer_sender();
    let payload = Bytes::from_static(&[1, 2, 3]);
    for i in 0..2i64 {
        let chunk = EncodedChunk::audio(i * 20_000, Some(20_000), payload.clone());
        sender.send(ChunkCmd::Audio(chunk)).await?;
    }

    for i in 0..2u64 {
        let flags = recv_segment(&mut muxer_in).await?;
        assert_eq!(decode_flags(&flags)?, (true, false));
        let timestamp = recv_segment(&mut muxer_in).await?;
        assert_eq!(decode_u64(&timestamp)?, i * 20_000, "accumulated timestamp");
        let duration = recv_segment(&mut muxer_in).await?;
        assert_eq!(decode_u64(&duration)?, 20_000);
        let data = recv_segment(&mut muxer_in).await?;
        assert_eq!(data, payload);
    }
    Ok(())
}

#[tokio::test]
async fn test_chunks_before_ack_stay_queued() -> anyhow::Result<()> {
    let (spawner, mut handle_rx) = test_muxer();
    let coordinator = Coordinator::new("test", spawner);
    coordinator
        .start(opus_metadata(), StreamOptions::default())
        .await?;
    let (mut muxer_in, muxer_events) = handle_rx
        .recv()
        .await
        .ok_or_else(|| anyhow::anyhow!("muxer was not spawned"))?;
    muxer_events.send(MuxerEvent::Ready).await?;
    match recv_input(&mut muxer_in).await? {
        MuxerInput::Start { .. } => {}
        other => anyhow::bail!("expected start, got {:?}", other),
    }

    // chunk arrives before the stream-open ack
    let sender = coordinator.producer_sender();
    let chunk = EncodedChunk::audio(0, Some(20_000), Bytes::from_static(b"early"));
    sender.send(ChunkCmd::Audio(chunk)).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        muxer_in.try_recv().is_err(),
        "no chunk data may precede the metadata block"
    );

    muxer_events.send(MuxerEvent::StartStream).await?;

    // metadata first, then the queued chunk
    for _ in 0..8 {
        recv_segment(&mut muxer_in).await?;
    }
    let flags = recv_segment(&mut muxer_in).await?;
    assert_eq!(decode_flags(&flags)?.0, true);
    let timestamp = recv_segment(&mut muxer_in).await?;
    assert_eq!(decode_u64(&timestamp)?, 0);
    Ok(())
}

#[tokio::test]
async fn test_end_waits_for_producer_exit() -> anyhow::Result<()> {
    let (coordinator, mut events, mut muxer_in, muxer_events) =
        open_stream(opus_metadata(), StreamOptions::default()).await?;

    coordinator.end().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        muxer_in.try_recv().is_err(),
        "muxer end must wait for the producer exit"
    );

    coordinator.producer_sender().send(ChunkCmd::Exit).await?;
    match recv_input(&mut muxer_in).await? {
        MuxerInput::End => {}
        other => anyhow::bail!("expected end, got {:?}", other),
    }

    muxer_events.send(MuxerEvent::Exit(0)).await?;
    match recv_event(&mut events).await? {
        StreamEvent::Exit(0) => {}
        other => anyhow::bail!("expected exit event, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_nonzero_muxer_exit_surfaces_error_then_terminates() -> anyhow::Result<()> {
    let (coordinator, mut events, mut muxer_in, muxer_events) =
        open_stream(opus_metadata(), StreamOptions::default()).await?;

    coordinator.producer_sender().send(ChunkCmd::Exit).await?;
    coordinator.end().await?;
    match recv_input(&mut muxer_in).await? {
        MuxerInput::End => {}
        other => anyhow::bail!("expected end, got {:?}", other),
    }

    muxer_events.send(MuxerEvent::Exit(3)).await?;
    match recv_event(&mut events).await? {
        StreamEvent::Error(detail) => {
            assert!(detail.contains("status 3"), "got {:?}", detail)
        }
        other => anyhow::bail!("expected error event, got {:?}", other),
    }
    match recv_event(&mut events).await? {
        StreamEvent::Exit(3) => {}
        other => anyhow::bail!("expected exit event, got {:?}", other),
    }

    // anything after termination is dropped
    let late = EncodedChunk::audio(0, Some(20_000), Bytes::from_static(b"late"));
    coordinator
        .producer_sender()
        .send(ChunkCmd::Audio(late))
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(muxer_in.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_muxed_data_and_producer_errors_relayed() -> anyhow::Result<()> {
    let (coordinator, mut events, _muxer_in, muxer_events) =
        open_stream(opus_metadata(), StreamOptions::default()).await?;

    muxer_events
        .send(MuxerEvent::MuxedData(Bytes::from_static(b"cluster")))
        .await?;
    match recv_event(&mut events).await? {
        StreamEvent::MuxedData(data) => assert_eq!(data.as_ref(), b"cluster"),
        other => anyhow::bail!("expected muxed data, got {:?}", other),
    }

    coordinator
        .producer_sender()
        .send(ChunkCmd::Error("encoder fault".to_string()))
        .await?;
    match recv_event(&mut events).await? {
        StreamEvent::Error(detail) => assert_eq!(detail, "encoder fault"),
        other => anyhow::bail!("expected error event, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_video_chunks_pass_through_framing() -> anyhow::Result<()> {
    let mut metadata = opus_metadata();
    metadata.video = true;
    let (coordinator, _events, mut muxer_in, _muxer_events) =
        open_stream(metadata, StreamOptions::default()).await?;

    let chunk = EncodedChunk::video(1_000, Some(33_000), true, Bytes::from_static(b"frame"));
    coordinator
        .producer_sender()
        .send(ChunkCmd::Video(chunk))
        .await?;

    let flags = recv_segment(&mut muxer_in).await?;
    assert_eq!(decode_flags(&flags)?, (true, false));
    assert_eq!(decode_u64(&recv_segment(&mut muxer_in).await?)?, 1_000);
    assert_eq!(decode_u64(&recv_segment(&mut muxer_in).await?)?, 33_000);
    assert_eq!(recv_segment(&mut muxer_in).await?.as_ref(), b"frame");
    Ok(())
}

#[tokio::test]
async fn test_start_rejects_invalid_metadata() -> anyhow::Result<()> {
    let (spawner, mut handle_rx) = test_muxer();
    let coordinator = Coordinator::new("test", spawner);
    let mut events = coordinator.subscribe();

    let bad = StreamMetadata::audio_only(AudioMetadata::opus(0, 2));
    assert!(coordinator.start(bad, StreamOptions::default()).await.is_err());
    match recv_event(&mut events).await? {
        StreamEvent::Error(detail) => assert!(detail.contains("sample_rate")),
        other => anyhow::bail!("expected error event, got {:?}", other),
    }

    // a configuration error aborts before the muxer is spawned
    assert!(handle_rx.try_recv().is_err());

    // the coordinator stays idle and accepts a valid start afterwards
    coordinator
        .start(opus_metadata(), StreamOptions::default())
        .await?;
    assert!(handle_rx.recv().await.is_some());
    Ok(())
}

#[tokio::test]
async fn test_event_stream_yields_relayed_events() -> anyhow::Result<()> {
    let (spawner, _handle_rx) = test_muxer();
    let coordinator = Coordinator::new("test", spawner);
    let mut stream = coordinator.event_stream();

    let bad = StreamMetadata::audio_only(AudioMetadata::opus(0, 2));
    let _ = coordinator.start(bad, StreamOptions::default()).await;

    match tokio::time::timeout(Duration::from_secs(2), stream.next()).await? {
        Some(StreamEvent::Error(detail)) => assert!(detail.contains("sample_rate")),
        other => anyhow::bail!("expected error event, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_unsolicited_requests_are_not_fatal() -> anyhow::Result<()> {
    let (spawner, _handle_rx) = test_muxer();
    let coordinator = Coordinator::new("test", spawner);

    assert!(coordinator.end().await.is_err(), "no active stream to end");

    // chunks in idle are dropped, and the stream can still be opened
    let chunk = EncodedChunk::audio(0, Some(20_000), Bytes::from_static(b"a"));
    coordinator
        .producer_sender()
        .send(ChunkCmd::Audio(chunk))
        .await?;
    coordinator
        .start(opus_metadata(), StreamOptions::default())
        .await?;

    assert!(
        coordinator
            .start(opus_metadata(), StreamOptions::default())
            .await
            .is_err(),
        "second start while active is rejected"
    );
    Ok(())
}
