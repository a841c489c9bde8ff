//! Async driver for [`MultiLayerEncoder`].
//!
//! The encoder is synchronous and not reentrant, so the task owns it on a
//! single blocking worker and feeds it frames and rate updates in arrival
//! order. Encoded layers are published on a broadcast channel.

use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::encoder::MultiLayerEncoder;
use crate::frame::{VideoFrame, VideoFrameType};
use crate::packet::{CodecSpecificInfo, EncodedImage};
use crate::rate::RateControlParameters;

pub type EncodedLayerSender = broadcast::Sender<EncodedLayerCmd>;
pub type EncodedLayerReceiver = broadcast::Receiver<EncodedLayerCmd>;
pub type EncodedLayerStream = Pin<Box<dyn Stream<Item = EncodedLayer> + Send>>;

/// One delivered layer image, detached from the encoder's reused buffer.
#[derive(Debug, Clone)]
pub struct EncodedLayer {
    pub image: EncodedImage,
    pub info: CodecSpecificInfo,
}

#[derive(Debug, Clone)]
pub enum EncodedLayerCmd {
    Data(EncodedLayer),
    EOF,
}

#[derive(Debug, Clone)]
pub enum EncoderCommand {
    Frame(VideoFrame, Option<Vec<VideoFrameType>>),
    SetRates(RateControlParameters),
    EOF,
}

pub struct EncoderTask {
    cancel: CancellationToken,
    layer_chan: EncodedLayerSender,
}

impl EncoderTask {
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        // encoded layers are small, a few frames of burst per layer
        const LAYER_CHAN_CAP: usize = 64;
        let (sender, _) = broadcast::channel(LAYER_CHAN_CAP);

        Self {
            cancel,
            layer_chan: sender,
        }
    }

    pub fn subscribe(&self) -> EncodedLayerReceiver {
        self.layer_chan.subscribe()
    }

    /// Stream of encoded layers that ends after end of input. Lagged
    /// receivers skip the lost items.
    pub fn stream(&self) -> EncodedLayerStream {
        let stream = BroadcastStream::new(self.subscribe())
            .take_while(|r| futures::future::ready(!matches!(r, Ok(EncodedLayerCmd::EOF))))
            .filter_map(|r| async move {
                match r {
                    Ok(EncodedLayerCmd::Data(layer)) => Some(layer),
                    Ok(EncodedLayerCmd::EOF) => None,
                    Err(e) => {
                        log::debug!("encoded layer stream: {}", e);
                        None
                    }
                }
            });
        Box::pin(stream)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn start(
        &self,
        encoder: MultiLayerEncoder,
        mut commands: tokio::sync::mpsc::Receiver<EncoderCommand>,
    ) -> JoinHandle<()> {
        let cancel_clone = self.cancel.clone();
        let sender_clone = self.layer_chan.clone();
        log::info!(
            "encoder loop started, {} layer(s)",
            encoder.num_layers()
        );
        // Frames beyond this are dropped rather than queued without bound.
        const FRAME_QUEUE_BOUND: usize = 128;
        const DROP_LOG_INTERVAL: u64 = 120;
        tokio::spawn(async move {
            let (tx, rx) = std::sync::mpsc::sync_channel::<EncoderCommand>(FRAME_QUEUE_BOUND);
            let handle_cancel = cancel_clone.clone();
            let handle = tokio::task::spawn_blocking(move || {
                Self::encoder_loop(encoder, handle_cancel, rx, sender_clone)
            });
            let mut dropped_count: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        break;
                    }
                    command = commands.recv() => {
                        let Some(command) = command else {
                            let _ = tx.send(EncoderCommand::EOF);
                            break;
                        };
                        let is_eof = matches!(&command, EncoderCommand::EOF);
                        let ok = match command {
                            EncoderCommand::Frame(..) => match tx.try_send(command) {
                                Ok(()) => true,
                                Err(std::sync::mpsc::TrySendError::Full(_)) => {
                                    dropped_count += 1;
                                    if dropped_count % DROP_LOG_INTERVAL == 1 {
                                        log::debug!(
                                            "encoder frame queue full, dropped {} frames (back-pressure)",
                                            dropped_count
                                        );
                                    }
                                    true
                                }
                                Err(std::sync::mpsc::TrySendError::Disconnected(_)) => false,
                            },
                            // rate updates and end of input are never dropped
                            _ => tx.send(command).is_ok(),
                        };
                        if !ok || is_eof {
                            break;
                        }
                    }
                }
            }
            let _ = handle.await;
            log::info!("encoder task finished, {} frame(s) dropped", dropped_count);
        })
    }

    fn encoder_loop(
        mut encoder: MultiLayerEncoder,
        cancel: CancellationToken,
        rx: std::sync::mpsc::Receiver<EncoderCommand>,
        out: EncodedLayerSender,
    ) {
        let delivery = out.clone();
        if let Err(e) = encoder.register_encode_complete_callback(
            move |image: &EncodedImage, info: &CodecSpecificInfo| {
                let _ = delivery.send(EncodedLayerCmd::Data(EncodedLayer {
                    image: image.clone(),
                    info: *info,
                }));
            },
        ) {
            log::error!("failed to register encode callback: {}", e);
            let _ = out.send(EncodedLayerCmd::EOF);
            return;
        }

        let mut frames: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(1)) {
                Ok(EncoderCommand::Frame(frame, frame_types)) => {
                    frames += 1;
                    if let Err(e) = encoder.encode(&frame, frame_types.as_deref()) {
                        log::warn!("encode frame {} failed: {}", frame.timestamp(), e);
                    }
                }
                Ok(EncoderCommand::SetRates(parameters)) => {
                    encoder.set_rates(&parameters);
                }
                Ok(EncoderCommand::EOF) => break,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => (),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        log::info!("end of encode task loop, {} frame(s) submitted", frames);
        let _ = encoder.release();
        let _ = out.send(EncodedLayerCmd::EOF);
    }
}

impl Default for EncoderTask {
    fn default() -> Self {
        Self::new()
    }
}
