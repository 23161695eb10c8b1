//! Batch Writer
//!
//! A standing thread that drains a bounded channel of line slices and hands
//! each slice to a [`LineWriter`] in one call. Producers block while the
//! channel is full. A `None` message stops the thread once everything queued
//! before it has been written.

use crate::influx::LineWriter;
use crate::queue::TaskCounter;
use anyhow::{Context, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

type Message = Option<Vec<String>>;

/// Producer half seen by stage code.
pub trait LineSink: Send + Sync {
    fn send(&self, lines: Vec<String>) -> Result<()>;
}

/// Totals reported when the writer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Slices written successfully
    pub slices: u64,
    pub lines: u64,
    /// Slices whose write call failed; they are not retried
    pub failed: u64,
}

/// Cloneable producer handle onto a [`BatchWriter`].
#[derive(Clone)]
pub struct LineSender {
    tx: SyncSender<Message>,
    pending: Arc<TaskCounter>,
}

impl LineSink for LineSender {
    fn send(&self, lines: Vec<String>) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        self.pending.add(1);
        if self.tx.send(Some(lines)).is_err() {
            self.pending.release(1);
            anyhow::bail!("Batch writer has stopped");
        }
        Ok(())
    }
}

pub struct BatchWriter {
    sender: LineSender,
    handle: JoinHandle<WriterStats>,
}

impl BatchWriter {
    /// Start the writer thread with a channel of `capacity` slices.
    ///
    /// Consecutive writes are spaced at least `flush_interval` apart.
    pub fn spawn(writer: Box<dyn LineWriter>, capacity: usize, flush_interval: Duration) -> Result<Self> {
        let (tx, rx) = sync_channel::<Message>(capacity.max(1));
        let pending = Arc::new(TaskCounter::default());

        let handle = {
            let pending = Arc::clone(&pending);
            std::thread::Builder::new()
                .name("batch-writer".to_string())
                .spawn(move || drain(rx, writer, flush_interval, &pending))
                .context("Failed to start batch writer thread")?
        };

        info!(capacity, flush_interval_ms = flush_interval.as_millis() as u64, "Batch writer started");
        Ok(Self {
            sender: LineSender { tx, pending },
            handle,
        })
    }

    pub fn sender(&self) -> LineSender {
        self.sender.clone()
    }

    /// Slices queued but not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.sender.pending.pending()
    }

    /// Block until every slice sent so far has been acknowledged.
    pub fn join(&self) {
        self.sender.pending.wait();
    }

    /// Send the stop message and wait for the thread to drain.
    pub fn finish(self) -> Result<WriterStats> {
        // A send error means the thread is already gone; join reports why.
        let _ = self.sender.tx.send(None);
        let stats = self
            .handle
            .join()
            .map_err(|_| anyhow::anyhow!("Batch writer thread panicked"))?;
        info!(
            slices = stats.slices,
            lines = stats.lines,
            failed = stats.failed,
            "Batch writer finished"
        );
        Ok(stats)
    }
}

fn drain(
    rx: Receiver<Message>,
    mut writer: Box<dyn LineWriter>,
    flush_interval: Duration,
    pending: &TaskCounter,
) -> WriterStats {
    let mut stats = WriterStats::default();
    let mut last_write: Option<Instant> = None;

    while let Ok(Some(lines)) = rx.recv() {
        if let Some(at) = last_write {
            let since = at.elapsed();
            if since < flush_interval {
                std::thread::sleep(flush_interval - since);
            }
        }

        let written = panic::catch_unwind(AssertUnwindSafe(|| writer.write(&lines)))
            .unwrap_or_else(|_| Err(anyhow::anyhow!("line writer panicked")));
        match written {
            Ok(()) => {
                stats.slices += 1;
                stats.lines += lines.len() as u64;
                debug!(lines = lines.len(), "Wrote slice");
            },
            Err(err) => {
                stats.failed += 1;
                error!(lines = lines.len(), error = %format!("{:#}", err), "Slice write failed");
            },
        }
        last_write = Some(Instant::now());
        let _ = pending.done();
    }

    stats
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every slice it is handed.
    #[derive(Clone, Default)]
    pub(crate) struct Recorder {
        pub(crate) slices: Arc<Mutex<Vec<Vec<String>>>>,
        pub(crate) fail_on: Option<usize>,
    }

    impl LineWriter for Recorder {
        fn write(&mut self, lines: &[String]) -> Result<()> {
            let mut slices = self.slices.lock().unwrap();
            slices.push(lines.to_vec());
            if Some(slices.len()) == self.fail_on {
                anyhow::bail!("rejected");
            }
            Ok(())
        }
    }

    fn slice(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("EURUSD bidquote={} {}", i, i)).collect()
    }

    #[test]
    fn test_every_slice_is_one_write() {
        let recorder = Recorder::default();
        let writer = BatchWriter::spawn(Box::new(recorder.clone()), 2, Duration::ZERO).unwrap();
        let sender = writer.sender();

        for n in [3, 1, 4, 1, 5] {
            sender.send(slice(n)).unwrap();
        }
        writer.join();
        assert_eq!(writer.pending(), 0);

        let stats = writer.finish().unwrap();
        assert_eq!(stats.slices, 5);
        assert_eq!(stats.lines, 14);
        let sizes: Vec<usize> = recorder.slices.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 1, 4, 1, 5]);
    }

    #[test]
    fn test_failed_write_is_acknowledged_and_counted() {
        let recorder = Recorder {
            fail_on: Some(2),
            ..Default::default()
        };
        let writer = BatchWriter::spawn(Box::new(recorder.clone()), 1, Duration::ZERO).unwrap();
        let sender = writer.sender();
        for _ in 0..3 {
            sender.send(slice(2)).unwrap();
        }
        writer.join();

        let stats = writer.finish().unwrap();
        assert_eq!(stats.slices, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(recorder.slices.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_flush_interval_spaces_writes() {
        let recorder = Recorder::default();
        let writer =
            BatchWriter::spawn(Box::new(recorder), 4, Duration::from_millis(30)).unwrap();
        let sender = writer.sender();

        let started = Instant::now();
        for _ in 0..3 {
            sender.send(slice(1)).unwrap();
        }
        writer.join();
        assert!(started.elapsed() >= Duration::from_millis(60));
        writer.finish().unwrap();
    }

    #[test]
    fn test_finish_acknowledges_every_slice_sent() {
        let recorder = Recorder::default();
        let writer = BatchWriter::spawn(Box::new(recorder.clone()), 2, Duration::ZERO).unwrap();
        let sender = writer.sender();
        for n in 1..=6 {
            sender.send(slice(n)).unwrap();
        }

        let stats = writer.finish().unwrap();
        assert_eq!(stats.slices, 6);
        assert_eq!(stats.lines, 21);
        assert_eq!(sender.pending.pending(), 0);
        assert_eq!(recorder.slices.lock().unwrap().len(), 6);
    }

    /// Panics on its first write.
    struct Panicky;

    impl LineWriter for Panicky {
        fn write(&mut self, _lines: &[String]) -> Result<()> {
            panic!("writer bug");
        }
    }

    #[test]
    fn test_panicking_writer_still_acknowledges() {
        let writer = BatchWriter::spawn(Box::new(Panicky), 1, Duration::ZERO).unwrap();
        let sender = writer.sender();
        sender.send(slice(2)).unwrap();
        sender.send(slice(1)).unwrap();
        writer.join();

        let stats = writer.finish().unwrap();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.slices, 0);
    }

    #[test]
    fn test_send_after_finish_fails() {
        let writer = BatchWriter::spawn(Box::new(Recorder::default()), 1, Duration::ZERO).unwrap();
        let sender = writer.sender();
        writer.finish().unwrap();
        assert!(sender.send(slice(1)).is_err());
    }
}
