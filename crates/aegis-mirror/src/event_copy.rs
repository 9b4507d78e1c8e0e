//! Bulk window copier for the event log.
//!
//! Three tasks cooperate per run, joined by bounded handoff queues:
//!
//! - a **position supplier** that reads a fresh destination position for each
//!   window (request/reply channels of capacity 1),
//! - a **producer** that exports one bounded window at a time from the source
//!   and forwards the COPY bytes,
//! - a **consumer** that imports each window into the destination and commits
//!   it independently.
//!
//! Each window's rows are stamped with the position fetched for that window
//! rather than a single snapshot position taken up front: strict per-row
//! snapshot isolation is traded for pagination that never blocks the source.
//! A window returning fewer rows than the bulk size is the last one.

use std::time::{Duration, Instant};

use aegis_store::{Store, StoreError, statements};
use aegis_types::{MirrorRunId, Position, Scope};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bookkeeping::Bookkeeper;
use crate::error::{JoinedErrors, MirrorError, Result, join_errors, prune_secondary_errors};
use crate::last_mirror::last_successful_position;
use crate::pump::{
    ConsumerReport, FRAME_QUEUE_CAPACITY, Frame, consume_windows, forward_stream, no_pre_clear,
    send_frame,
};

/// Options for the event-log phase.
#[derive(Debug, Clone)]
pub struct EventCopyOptions {
    /// Rows per export/import window.
    pub bulk_size: u64,
    /// Ignore bookkeeping history and copy from the zero position.
    pub ignore_previous: bool,
}

impl Default for EventCopyOptions {
    fn default() -> Self {
        Self {
            bulk_size: 10_000,
            ignore_previous: false,
        }
    }
}

/// Outcome of a successful event-log copy.
#[derive(Debug, Clone)]
pub struct EventCopyReport {
    pub run_id: MirrorRunId,
    /// Resume lower bound (exclusive).
    pub from: Position,
    /// Upper bound (inclusive), recorded by the succeeded event.
    pub to: Position,
    /// Rows committed on the destination.
    pub rows: u64,
    /// Windows issued, including the final short one.
    pub windows: u64,
    pub duration: Duration,
}

/// What the producer side did.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ProducerReport {
    pub rows: u64,
    pub windows: u64,
}

/// Runs the event-log mirror phase: derives bounds, records bookkeeping,
/// copies windows, records the outcome.
pub async fn copy_events(
    source: &Store,
    destination: &Store,
    scope: &Scope,
    options: &EventCopyOptions,
    cancel: &CancellationToken,
) -> Result<EventCopyReport> {
    let started_at = Instant::now();
    let bulk_size = options.bulk_size.max(1);

    let from = last_successful_position(source, destination.identity(), options.ignore_previous)
        .await?;
    let mut bookkeeper = Bookkeeper::new(source, destination.identity());
    let to = bookkeeper.write_started(scope).await?;
    let run_id = bookkeeper.run_id().clone();

    match run_pipeline(source, destination, scope, from, to, bulk_size, cancel).await {
        Ok((producer, consumer)) => {
            if producer.rows != consumer.rows {
                tracing::warn!(
                    exported = producer.rows,
                    imported = consumer.rows,
                    "event export/import row counts differ"
                );
            }
            bookkeeper.write_succeeded(to).await?;
            Ok(EventCopyReport {
                run_id,
                from,
                to,
                rows: consumer.rows,
                windows: producer.windows,
                duration: started_at.elapsed(),
            })
        }
        Err(error) => {
            if let Err(bookkeeping_error) = bookkeeper.write_failed(&error.to_string()).await {
                return Err(MirrorError::Transfer(JoinedErrors(vec![
                    error,
                    bookkeeping_error,
                ])));
            }
            Err(error)
        }
    }
}

/// Spawns the supplier/producer/consumer trio and joins their outcomes into
/// a single result.
async fn run_pipeline(
    source: &Store,
    destination: &Store,
    scope: &Scope,
    from: Position,
    to: Position,
    bulk_size: u64,
    cancel: &CancellationToken,
) -> Result<(ProducerReport, ConsumerReport)> {
    let (request_tx, request_rx) = mpsc::channel(1);
    let (reply_tx, reply_rx) = mpsc::channel(1);
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);

    let supplier = tokio::spawn(supply_positions(
        destination.clone(),
        request_rx,
        reply_tx,
        cancel.child_token(),
    ));

    let producer = {
        let source = source.clone();
        let scope = scope.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let fetch = move |window: u64, stamp: Position| {
                let source = source.clone();
                let scope = scope.clone();
                async move {
                    let statement = statements::events_window_copy_out(
                        &scope, from, to, stamp, bulk_size, window,
                    );
                    tracing::debug!(window, stamp = %stamp, "exporting event window");
                    let stream = source.copy_out(&statement).await?;
                    Ok(stream
                        .map(|chunk| chunk.map_err(|e| MirrorError::from(StoreError::from(e)))))
                }
            };
            produce_windows(bulk_size, request_tx, reply_rx, frame_tx, fetch, cancel).await
        })
    };

    let consumer = {
        let destination = destination.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let open = move || {
                let destination = destination.clone();
                async move { Ok(destination.copy_in(statements::EVENTS_COPY_IN).await?) }
            };
            consume_windows(frame_rx, open, no_pre_clear(), cancel).await
        })
    };

    let (producer, consumer, supplier) = tokio::join!(producer, consumer, supplier);

    let mut errors = Vec::new();
    let producer = collect_task(producer, &mut errors);
    let consumer = collect_task(consumer, &mut errors);
    collect_task(supplier, &mut errors);
    prune_secondary_errors(&mut errors);
    if let Some(error) = join_errors(errors) {
        return Err(error);
    }
    match (producer, consumer) {
        (Some(producer), Some(consumer)) => Ok((producer, consumer)),
        // Unreachable in practice: no error implies both reports exist.
        _ => Err(MirrorError::ChannelClosed),
    }
}

fn collect_task<T>(
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
    errors: &mut Vec<MirrorError>,
) -> Option<T> {
    match joined {
        Ok(Ok(value)) => Some(value),
        Ok(Err(error)) => {
            errors.push(error);
            None
        }
        Err(join_error) => {
            errors.push(MirrorError::Task(join_error.to_string()));
            None
        }
    }
}

/// Supplies one destination position per producer request. Exits when the
/// request channel closes; a failed position query is forwarded to the
/// producer, which aborts the run.
pub(crate) async fn supply_positions(
    destination: Store,
    mut requests: mpsc::Receiver<()>,
    replies: mpsc::Sender<Result<Position>>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let request = tokio::select! {
            () = cancel.cancelled() => return Err(MirrorError::Cancelled),
            request = requests.recv() => request,
        };
        if request.is_none() {
            return Ok(());
        }
        match destination.position().await {
            Ok(position) => {
                if replies.send(Ok(position)).await.is_err() {
                    return Ok(());
                }
            }
            Err(error) => {
                let message = error.to_string();
                if replies
                    .send(Err(MirrorError::Position(message.clone())))
                    .await
                    .is_err()
                {
                    // Producer already gone; surface the failure ourselves.
                    return Err(MirrorError::Position(message));
                }
                return Ok(());
            }
        }
    }
}

/// Source-side producer: requests a fresh stamp per window, exports the
/// window, forwards its bytes, and stops at the first short window.
pub(crate) async fn produce_windows<F, Fut, St>(
    bulk_size: u64,
    position_requests: mpsc::Sender<()>,
    mut position_replies: mpsc::Receiver<Result<Position>>,
    frames: mpsc::Sender<Frame>,
    mut fetch: F,
    cancel: CancellationToken,
) -> Result<ProducerReport>
where
    F: FnMut(u64, Position) -> Fut + Send,
    Fut: Future<Output = Result<St>> + Send,
    St: Stream<Item = Result<Bytes>> + Unpin + Send,
{
    let mut total = 0u64;
    let mut window = 0u64;
    loop {
        let stamp =
            request_position(&position_requests, &mut position_replies, &cancel).await?;
        let mut stream = fetch(window, stamp).await?;
        let rows = forward_stream(&mut stream, &frames, &cancel).await?;
        send_frame(&frames, Frame::WindowEnd, &cancel).await?;
        total += rows;
        window += 1;
        if rows < bulk_size {
            return Ok(ProducerReport {
                rows: total,
                windows: window,
            });
        }
    }
}

async fn request_position(
    requests: &mpsc::Sender<()>,
    replies: &mut mpsc::Receiver<Result<Position>>,
    cancel: &CancellationToken,
) -> Result<Position> {
    if requests.send(()).await.is_err() {
        return Err(MirrorError::ChannelClosed);
    }
    let reply = tokio::select! {
        () = cancel.cancelled() => return Err(MirrorError::Cancelled),
        reply = replies.recv() => reply,
    };
    reply.ok_or(MirrorError::ChannelClosed)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::sync::{Arc, Mutex};

    fn position(n: i64) -> Position {
        Position::new(Decimal::new(n, 0))
    }

    /// Replies to position requests with 1, 2, 3, ...
    fn spawn_counting_supplier() -> (mpsc::Sender<()>, mpsc::Receiver<Result<Position>>) {
        let (request_tx, mut request_rx) = mpsc::channel::<()>(1);
        let (reply_tx, reply_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut next = 1i64;
            while request_rx.recv().await.is_some() {
                if reply_tx.send(Ok(position(next))).await.is_err() {
                    break;
                }
                next += 1;
            }
        });
        (request_tx, reply_rx)
    }

    /// Consumes and discards frames so the producer is never backpressured.
    fn spawn_draining_consumer(mut frames: mpsc::Receiver<Frame>) {
        tokio::spawn(async move { while frames.recv().await.is_some() {} });
    }

    fn window_fetcher(
        sizes: Vec<u64>,
    ) -> (
        impl FnMut(u64, Position) -> std::future::Ready<
            Result<futures::stream::Iter<std::vec::IntoIter<Result<Bytes>>>>,
        >,
        Arc<Mutex<Vec<(u64, Position)>>>,
    ) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let fetch = move |window: u64, stamp: Position| {
            seen.lock().unwrap().push((window, stamp));
            let rows = sizes.get(window as usize).copied().unwrap_or(0);
            let chunk = Bytes::from("r\n".repeat(rows as usize));
            std::future::ready(Ok(futures::stream::iter(vec![Ok(chunk)])))
        };
        (fetch, calls)
    }

    #[tokio::test]
    async fn stops_after_first_short_window() {
        // 250 rows at bulk size 100: three windows of 100, 100, 50.
        let (fetch, calls) = window_fetcher(vec![100, 100, 50]);
        let (request_tx, reply_rx) = spawn_counting_supplier();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        spawn_draining_consumer(frame_rx);

        let report = produce_windows(
            100,
            request_tx,
            reply_rx,
            frame_tx,
            fetch,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report, ProducerReport { rows: 250, windows: 3 });
        // Every window was stamped with a position fresh to that window.
        assert_eq!(
            *calls.lock().unwrap(),
            vec![(0, position(1)), (1, position(2)), (2, position(3))]
        );
    }

    #[tokio::test]
    async fn exact_multiple_issues_one_trailing_empty_window() {
        // 200 rows at bulk size 100: the third window returns zero rows.
        let (fetch, calls) = window_fetcher(vec![100, 100]);
        let (request_tx, reply_rx) = spawn_counting_supplier();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        spawn_draining_consumer(frame_rx);

        let report = produce_windows(
            100,
            request_tx,
            reply_rx,
            frame_tx,
            fetch,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report, ProducerReport { rows: 200, windows: 3 });
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn empty_source_issues_exactly_one_window() {
        let (fetch, _calls) = window_fetcher(vec![]);
        let (request_tx, reply_rx) = spawn_counting_supplier();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        spawn_draining_consumer(frame_rx);

        let report = produce_windows(
            100,
            request_tx,
            reply_rx,
            frame_tx,
            fetch,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report, ProducerReport { rows: 0, windows: 1 });
    }

    #[tokio::test]
    async fn frames_delimit_each_window() {
        let (fetch, _calls) = window_fetcher(vec![2, 1]);
        let (request_tx, reply_rx) = spawn_counting_supplier();
        let (frame_tx, mut frame_rx) = mpsc::channel(16);

        let producer = tokio::spawn(produce_windows(
            2,
            request_tx,
            reply_rx,
            frame_tx,
            fetch,
            CancellationToken::new(),
        ));

        let mut summary = Vec::new();
        while let Some(frame) = frame_rx.recv().await {
            match frame {
                Frame::Data(chunk) => summary.push(format!("data:{}", chunk.len())),
                Frame::WindowEnd => summary.push("end".to_string()),
            }
        }
        producer.await.unwrap().unwrap();

        assert_eq!(summary, vec!["data:4", "end", "data:2", "end"]);
    }

    #[tokio::test]
    async fn position_failure_aborts_the_run() {
        let (request_tx, mut request_rx) = mpsc::channel::<()>(1);
        let (reply_tx, reply_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let _ = request_rx.recv().await;
            let _ = reply_tx
                .send(Err(MirrorError::Position("oracle down".to_string())))
                .await;
        });
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        spawn_draining_consumer(frame_rx);
        let (fetch, calls) = window_fetcher(vec![10]);

        let err = produce_windows(
            100,
            request_tx,
            reply_rx,
            frame_tx,
            fetch,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, MirrorError::Position(_)));
        // No window was exported without a stamp.
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_unwinds_the_producer() {
        let (fetch, _calls) = window_fetcher(vec![100, 100, 100]);
        let (request_tx, reply_rx) = spawn_counting_supplier();
        // Nothing drains the frame channel: the producer will backpressure.
        let (frame_tx, _frame_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let producer = tokio::spawn(produce_windows(
            100,
            request_tx,
            reply_rx,
            frame_tx,
            fetch,
            cancel.clone(),
        ));
        cancel.cancel();

        let err = producer.await.unwrap().unwrap_err();
        assert!(matches!(err, MirrorError::Cancelled));
    }

}
