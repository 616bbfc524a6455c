use bytes::Bytes;
use futures::StreamExt;
use webm_bus::{
    chunk::{ChunkCmd, EncodedChunk},
    coordinator::{Coordinator, StreamEvent},
    metadata::{AudioMetadata, StreamMetadata, StreamOptions},
    muxer::{MuxerEvent, MuxerInput, MuxerLink},
};

/// Stand-in muxer: acks the handshake and echoes every wire segment back as
/// muxed data. Shows the full coordinator lifecycle without a container
/// builder attached.
fn spawn_echo_muxer() -> MuxerLink {
    let (input_tx, mut input_rx) = tokio::sync::mpsc::channel(1024);
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(1024);

    tokio::spawn(async move {
        let _ = event_tx.send(MuxerEvent::Ready).await;
        while let Some(input) = input_rx.recv().await {
            match input {
                MuxerInput::Start { metadata, .. } => {
                    println!("muxer: start, audio={}", metadata.audio.is_some());
                    let _ = event_tx.send(MuxerEvent::StartStream).await;
                }
                MuxerInput::StreamData(data) => {
                    let _ = event_tx.send(MuxerEvent::MuxedData(data)).await;
                }
                MuxerInput::End => {
                    let _ = event_tx.send(MuxerEvent::Exit(0)).await;
                    break;
                }
            }
        }
    });

    MuxerLink {
        input: input_tx,
        events: event_rx,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let coordinator = Coordinator::new("demo", spawn_echo_muxer);
    let mut events = coordinator.event_stream();

    let metadata = StreamMetadata::audio_only(AudioMetadata::opus(48_000, 2));
    coordinator.start(metadata, StreamOptions::default()).await?;

    // Producers hold off until the stream open is acknowledged.
    while let Some(event) = events.next().await {
        if let StreamEvent::StartStream = event {
            println!("stream open acknowledged");
            break;
        }
    }

    // 1s of synthetic Opus cadence: 50 chunks of 20ms (timestamps in us).
    let sender = coordinator.producer_sender();
    for i in 0..50i64 {
        let chunk = EncodedChunk::audio(i * 20_000, Some(20_000), Bytes::from(vec![0u8; 160]));
        sender.send(ChunkCmd::Audio(chunk)).await?;
    }
    sender.send(ChunkCmd::Exit).await?;
    coordinator.end().await?;

    let mut total = 0usize;
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::MuxedData(data) => total += data.len(),
            StreamEvent::Error(detail) => log::error!("stream error: {}", detail),
            StreamEvent::Exit(code) => {
                println!("muxer exited with status {}, {} bytes muxed", code, total);
                break;
            }
            StreamEvent::StartStream => {}
        }
    }

    Ok(())
}
