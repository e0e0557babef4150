// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stream multiplexing over one byte-ordered transport.
//!
//! One task reads and demultiplexes inbound frames to per-stream channels;
//! one task drains an outbound channel shared by every stream sender.
//! Frames on one stream keep their order; streams interleave arbitrarily.
//! The destination side registers an acceptor and is handed a receiver for
//! each stream id it has not seen before.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use slog::{debug, o, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::{Frame, FrameCodec, Message, ProtocolError};
use super::MigrateError;

/// Outbound frames buffered across all streams before senders see
/// backpressure.
const WRITE_QUEUE: usize = 512;
/// Inbound frames buffered per stream before the reader stalls.
const STREAM_QUEUE: usize = 128;

/// A newly-accepted inbound stream (destination side).
pub(crate) struct IncomingStream {
    pub id: u32,
    pub tx: StreamSender,
    pub rx: StreamReceiver,
}

/// Destination-side stream acceptance: where new streams are surfaced,
/// plus a counter the read task bumps *before* dispatching any later
/// frame, so "how many streams exist" is never behind the frames a
/// consumer has already seen.
pub(crate) struct Acceptor {
    pub tx: mpsc::Sender<IncomingStream>,
    pub seen: Arc<AtomicUsize>,
}

/// Sends messages on one logical stream.
#[derive(Clone)]
pub(crate) struct StreamSender {
    id: u32,
    tx: mpsc::Sender<Frame>,
}

impl StreamSender {
    pub async fn send(&self, message: Message) -> Result<(), MigrateError> {
        self.tx
            .send(Frame::new(self.id, message))
            .await
            .map_err(|_| MigrateError::TransportClosed)
    }
}

/// Receives messages from one logical stream. Yields `None` once the
/// transport has drained.
pub(crate) struct StreamReceiver {
    rx: mpsc::Receiver<Message>,
}

impl StreamReceiver {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

pub(crate) struct Mux {
    writer_tx: mpsc::Sender<Frame>,
    streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Message>>>>,
    error: Arc<Mutex<Option<MigrateError>>>,
    cancel: CancellationToken,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl Mux {
    /// Start the read/write tasks over the split transport. If `accept` is
    /// provided, frames for unregistered streams create new streams and are
    /// surfaced there; otherwise they are a protocol violation.
    pub fn start<R, W>(
        reader: R,
        writer: W,
        accept: Option<Acceptor>,
        cancel: CancellationToken,
        log: &Logger,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE);
        let streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Message>>>> =
            Arc::default();
        let error: Arc<Mutex<Option<MigrateError>>> = Arc::default();

        let read_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&streams),
            accept,
            writer_tx.clone(),
            Arc::clone(&error),
            cancel.clone(),
            log.new(o!("mux" => "read")),
        ));
        let write_task = tokio::spawn(write_loop(
            writer,
            writer_rx,
            Arc::clone(&error),
            cancel.clone(),
            log.new(o!("mux" => "write")),
        ));

        Self { writer_tx, streams, error, cancel, read_task, write_task }
    }

    /// Register a stream id (source side) and return its endpoints.
    pub fn open(&self, id: u32) -> (StreamSender, StreamReceiver) {
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        self.streams.lock().unwrap().insert(id, tx);
        (
            StreamSender { id, tx: self.writer_tx.clone() },
            StreamReceiver { rx },
        )
    }

    /// Tear the transport down and return the first recorded error, if any.
    pub async fn shutdown(self) -> Option<MigrateError> {
        // Dropping our writer handle lets the write task drain and exit
        // once every stream sender is gone.
        let Self { writer_tx, streams, error, cancel, read_task, write_task } =
            self;
        drop(writer_tx);
        streams.lock().unwrap().clear();
        cancel.cancel();
        let _ = read_task.await;
        let _ = write_task.await;
        let result = error.lock().unwrap().take();
        result
    }
}

fn record(slot: &Arc<Mutex<Option<MigrateError>>>, err: MigrateError) {
    let mut slot = slot.lock().unwrap();
    if slot.is_none() {
        *slot = Some(err);
    }
}

async fn read_loop<R>(
    reader: R,
    streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Message>>>>,
    accept: Option<Acceptor>,
    writer_tx: mpsc::Sender<Frame>,
    error: Arc<Mutex<Option<MigrateError>>>,
    cancel: CancellationToken,
    log: Logger,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut framed = FramedRead::new(reader, FrameCodec::new());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };
        match frame {
            None => {
                debug!(log, "transport EOF");
                break;
            }
            Some(Err(e)) => {
                record(&error, MigrateError::Protocol(e));
                cancel.cancel();
                break;
            }
            Some(Ok(frame)) => {
                let tx = streams.lock().unwrap().get(&frame.stream).cloned();
                let tx = match tx {
                    Some(tx) => tx,
                    None => match &accept {
                        Some(acceptor) => {
                            let (tx, rx) = mpsc::channel(STREAM_QUEUE);
                            streams
                                .lock()
                                .unwrap()
                                .insert(frame.stream, tx.clone());
                            acceptor.seen.fetch_add(1, Ordering::SeqCst);
                            if acceptor
                                .tx
                                .send(IncomingStream {
                                    id: frame.stream,
                                    tx: StreamSender {
                                        id: frame.stream,
                                        tx: writer_tx.clone(),
                                    },
                                    rx: StreamReceiver { rx },
                                })
                                .await
                                .is_err()
                            {
                                // Session is no longer accepting; drain
                                // quietly until cancellation.
                                continue;
                            }
                            tx
                        }
                        None => {
                            record(
                                &error,
                                MigrateError::Protocol(
                                    ProtocolError::UnknownStream(frame.stream),
                                ),
                            );
                            cancel.cancel();
                            break;
                        }
                    },
                };
                // A dropped receiver means that device is already done;
                // residual frames for it are not an error.
                let _ = tx.send(frame.message).await;
            }
        }
    }
    // Wake every per-stream reader with end-of-stream.
    streams.lock().unwrap().clear();
}

async fn write_loop<W>(
    writer: W,
    mut rx: mpsc::Receiver<Frame>,
    error: Arc<Mutex<Option<MigrateError>>>,
    cancel: CancellationToken,
    log: Logger,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = FramedWrite::new(writer, FrameCodec::new());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                // Best-effort flush of whatever is already queued.
                while let Ok(frame) = rx.try_recv() {
                    if framed.feed(frame).await.is_err() {
                        break;
                    }
                }
                let _ = framed.flush().await;
                return;
            }
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else {
            let _ = framed.flush().await;
            debug!(log, "all stream senders dropped");
            return;
        };
        let mut result = framed.feed(frame).await;
        // Coalesce queued frames into one flush.
        while result.is_ok() {
            match rx.try_recv() {
                Ok(frame) => result = framed.feed(frame).await,
                Err(_) => break,
            }
        }
        if result.is_ok() {
            result = framed.flush().await;
        }
        if let Err(e) = result {
            record(&error, MigrateError::Protocol(e));
            cancel.cancel();
            return;
        }
    }
}
