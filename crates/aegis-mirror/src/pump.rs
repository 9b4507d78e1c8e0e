//! Producer/consumer plumbing shared by the event-log and table copiers.
//!
//! A copy streams COPY-format bytes from a source-side producer to a
//! destination-side consumer over one bounded channel, so memory stays
//! bounded regardless of table size: the producer suspends until the
//! consumer drains. Frames delimit windows; the consumer commits one
//! destination import per window, so an interrupted run leaves a
//! well-defined prefix of fully committed windows.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use aegis_store::BulkSink;

use crate::error::{MirrorError, Result};

/// Capacity of the byte-frame handoff queue. Small on purpose: backpressure,
/// and a failing partner is noticed after at most this many buffered frames.
pub(crate) const FRAME_QUEUE_CAPACITY: usize = 2;

/// One hop on the transfer channel.
#[derive(Debug)]
pub(crate) enum Frame {
    /// Raw COPY bytes belonging to the current window.
    Data(Bytes),
    /// The current window is complete and should be committed.
    WindowEnd,
}

/// What the consumer side did.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ConsumerReport {
    /// Rows committed on the destination.
    pub rows: u64,
    /// Rows removed by the replace pre-clear, if one ran.
    pub cleared: Option<u64>,
}

/// Counts rows in a chunk of COPY text output: one newline per row, and
/// newlines inside values are escaped by the format, so a raw `\n` is always
/// a row terminator.
pub(crate) fn count_rows(chunk: &[u8]) -> u64 {
    chunk.iter().filter(|&&b| b == b'\n').count() as u64
}

/// Sends one frame, observing cancellation while the queue is full.
pub(crate) async fn send_frame(
    frames: &mpsc::Sender<Frame>,
    frame: Frame,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(MirrorError::Cancelled),
        sent = frames.send(frame) => sent.map_err(|_| MirrorError::ChannelClosed),
    }
}

/// Forwards one window's byte stream into the frame channel, returning the
/// number of rows seen. Does not emit the trailing [`Frame::WindowEnd`].
pub(crate) async fn forward_stream<St>(
    stream: &mut St,
    frames: &mpsc::Sender<Frame>,
    cancel: &CancellationToken,
) -> Result<u64>
where
    St: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut rows = 0u64;
    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => return Err(MirrorError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            return Ok(rows);
        };
        let chunk = chunk?;
        rows += count_rows(&chunk);
        send_frame(frames, Frame::Data(chunk), cancel).await?;
    }
}

/// The `pre_clear` argument for copies without replace semantics.
pub(crate) fn no_pre_clear() -> Option<fn() -> std::future::Ready<Result<u64>>> {
    None
}

/// Destination-side consumer: drains frames, opening one bulk import per
/// window via `open` and committing it at each [`Frame::WindowEnd`].
///
/// The optional `pre_clear` runs on this task before the first import, so
/// clearing and writing cannot race. A producer that goes away mid-window
/// (channel closed without a `WindowEnd`) aborts the open import and returns
/// the rows committed so far; the producer's own error carries the cause.
pub(crate) async fn consume_windows<S, O, FO, P, FP>(
    mut frames: mpsc::Receiver<Frame>,
    mut open: O,
    pre_clear: Option<P>,
    cancel: CancellationToken,
) -> Result<ConsumerReport>
where
    S: BulkSink,
    O: FnMut() -> FO + Send,
    FO: Future<Output = Result<S>> + Send,
    P: FnOnce() -> FP + Send,
    FP: Future<Output = Result<u64>> + Send,
{
    let mut cleared = None;
    if let Some(clear) = pre_clear {
        cleared = Some(clear().await?);
    }

    let mut rows = 0u64;
    let mut sink: Option<S> = None;
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => {
                if let Some(open_sink) = sink.take() {
                    let _ = open_sink.abort("mirror run cancelled").await;
                }
                return Err(MirrorError::Cancelled);
            }
            frame = frames.recv() => frame,
        };
        match frame {
            Some(Frame::Data(chunk)) => {
                let mut open_sink = match sink.take() {
                    Some(open_sink) => open_sink,
                    None => open().await?,
                };
                if let Err(error) = open_sink.send(chunk).await {
                    let _ = open_sink.abort("import failed").await;
                    return Err(error.into());
                }
                sink = Some(open_sink);
            }
            Some(Frame::WindowEnd) => {
                // An empty window opens no import at all.
                if let Some(open_sink) = sink.take() {
                    rows += open_sink.finish().await?;
                }
            }
            None => {
                if let Some(open_sink) = sink.take() {
                    let _ = open_sink.abort("producer closed mid-window").await;
                }
                return Ok(ConsumerReport { rows, cleared });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Default, Clone)]
    struct SinkLog {
        committed: Arc<Mutex<Vec<String>>>,
        aborted: Arc<Mutex<Vec<String>>>,
        opened: Arc<AtomicUsize>,
    }

    struct MemorySink {
        buffer: Vec<u8>,
        log: SinkLog,
    }

    impl MemorySink {
        fn open(log: &SinkLog) -> Self {
            log.opened.fetch_add(1, Ordering::SeqCst);
            Self {
                buffer: Vec::new(),
                log: log.clone(),
            }
        }
    }

    impl BulkSink for MemorySink {
        async fn send(&mut self, chunk: Bytes) -> aegis_store::Result<()> {
            self.buffer.extend_from_slice(&chunk);
            Ok(())
        }

        async fn finish(self) -> aegis_store::Result<u64> {
            let rows = count_rows(&self.buffer);
            self.log
                .committed
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&self.buffer).into_owned());
            Ok(rows)
        }

        async fn abort(self, reason: &str) -> aegis_store::Result<()> {
            self.log.aborted.lock().unwrap().push(reason.to_string());
            Ok(())
        }
    }

    fn opener(log: &SinkLog) -> impl FnMut() -> std::future::Ready<Result<MemorySink>> + use<> {
        let log = log.clone();
        move || std::future::ready(Ok(MemorySink::open(&log)))
    }

    #[test]
    fn counts_rows_across_chunk_boundaries() {
        assert_eq!(count_rows(b""), 0);
        assert_eq!(count_rows(b"acme\tuser.added\t{}\n"), 1);
        // A row split across two chunks is only counted once.
        assert_eq!(count_rows(b"acme\tuser.") + count_rows(b"added\t{}\n"), 1);
        assert_eq!(count_rows(b"a\nb\nc\n"), 3);
    }

    #[tokio::test]
    async fn commits_one_import_per_window() {
        let log = SinkLog::default();
        let (tx, rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let consumer = tokio::spawn(consume_windows(
            rx,
            opener(&log),
            no_pre_clear(),
            CancellationToken::new(),
        ));

        tx.send(Frame::Data(Bytes::from_static(b"row1\nrow2\n")))
            .await
            .unwrap();
        tx.send(Frame::WindowEnd).await.unwrap();
        tx.send(Frame::Data(Bytes::from_static(b"row3\n")))
            .await
            .unwrap();
        tx.send(Frame::WindowEnd).await.unwrap();
        drop(tx);

        let report = consumer.await.unwrap().unwrap();
        assert_eq!(report, ConsumerReport { rows: 3, cleared: None });
        assert_eq!(log.opened.load(Ordering::SeqCst), 2);
        assert_eq!(
            *log.committed.lock().unwrap(),
            vec!["row1\nrow2\n".to_string(), "row3\n".to_string()]
        );
        assert!(log.aborted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_window_opens_no_import() {
        let log = SinkLog::default();
        let (tx, rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let consumer = tokio::spawn(consume_windows(
            rx,
            opener(&log),
            no_pre_clear(),
            CancellationToken::new(),
        ));

        tx.send(Frame::WindowEnd).await.unwrap();
        drop(tx);

        let report = consumer.await.unwrap().unwrap();
        assert_eq!(report.rows, 0);
        assert_eq!(log.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pre_clear_runs_once_before_first_import() {
        let log = SinkLog::default();
        let cleared_before_open = Arc::new(AtomicUsize::new(usize::MAX));
        let (tx, rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);

        let observed = Arc::clone(&cleared_before_open);
        let observed_log = log.clone();
        let pre_clear = move || {
            // Record how many imports had been opened when the clear ran.
            observed.store(observed_log.opened.load(Ordering::SeqCst), Ordering::SeqCst);
            std::future::ready(Ok(7u64))
        };
        let consumer = tokio::spawn(consume_windows(
            rx,
            opener(&log),
            Some(pre_clear),
            CancellationToken::new(),
        ));

        tx.send(Frame::Data(Bytes::from_static(b"row\n"))).await.unwrap();
        tx.send(Frame::WindowEnd).await.unwrap();
        drop(tx);

        let report = consumer.await.unwrap().unwrap();
        assert_eq!(report, ConsumerReport { rows: 1, cleared: Some(7) });
        assert_eq!(cleared_before_open.load(Ordering::SeqCst), 0);
    }

    struct BrokenSink {
        log: SinkLog,
    }

    impl BulkSink for BrokenSink {
        async fn send(&mut self, _chunk: Bytes) -> aegis_store::Result<()> {
            Err(sqlx::Error::Protocol("connection reset".to_string()).into())
        }

        async fn finish(self) -> aegis_store::Result<u64> {
            Ok(0)
        }

        async fn abort(self, reason: &str) -> aegis_store::Result<()> {
            self.log.aborted.lock().unwrap().push(reason.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_send_aborts_the_open_import() {
        let log = SinkLog::default();
        let (tx, rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let open_log = log.clone();
        let open = move || {
            std::future::ready(Ok(BrokenSink {
                log: open_log.clone(),
            }))
        };
        let consumer = tokio::spawn(consume_windows(
            rx,
            open,
            no_pre_clear(),
            CancellationToken::new(),
        ));

        tx.send(Frame::Data(Bytes::from_static(b"row1\n")))
            .await
            .unwrap();

        let err = consumer.await.unwrap().unwrap_err();
        assert!(matches!(err, MirrorError::Store(_)));
        assert_eq!(
            *log.aborted.lock().unwrap(),
            vec!["import failed".to_string()]
        );
    }

    #[tokio::test]
    async fn producer_loss_mid_window_aborts_open_import() {
        let log = SinkLog::default();
        let (tx, rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let consumer = tokio::spawn(consume_windows(
            rx,
            opener(&log),
            no_pre_clear(),
            CancellationToken::new(),
        ));

        tx.send(Frame::Data(Bytes::from_static(b"row1\n")))
            .await
            .unwrap();
        tx.send(Frame::WindowEnd).await.unwrap();
        tx.send(Frame::Data(Bytes::from_static(b"partial")))
            .await
            .unwrap();
        drop(tx);

        let report = consumer.await.unwrap().unwrap();
        assert_eq!(report.rows, 1);
        assert_eq!(log.committed.lock().unwrap().len(), 1);
        assert_eq!(
            *log.aborted.lock().unwrap(),
            vec!["producer closed mid-window".to_string()]
        );
    }

    #[tokio::test]
    async fn cancellation_aborts_and_unwinds() {
        let log = SinkLog::default();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let consumer = tokio::spawn(consume_windows(
            rx,
            opener(&log),
            no_pre_clear(),
            cancel.clone(),
        ));

        tx.send(Frame::Data(Bytes::from_static(b"row1\n")))
            .await
            .unwrap();
        cancel.cancel();

        let err = consumer.await.unwrap().unwrap_err();
        assert!(matches!(err, MirrorError::Cancelled));
    }

    #[tokio::test]
    async fn send_frame_fails_fast_when_consumer_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = send_frame(&tx, Frame::WindowEnd, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::ChannelClosed));
    }
}
