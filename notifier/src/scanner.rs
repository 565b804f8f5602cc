use crate::bus::ReleaseMessageListener;
use crate::config::ScannerConfig;
use crate::message_log::{LogError, ReleaseMessageLog};
use crate::metrics_defs::SCANNER_ERRORS;
use shared::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, sleep};

#[derive(thiserror::Error, Debug)]
pub enum ScannerError {
    #[error("release message log error: {0}")]
    Log(#[from] LogError),
    #[error("the scanner is not running")]
    Stopped,
}

#[derive(Debug)]
pub enum Command {
    // Scan outside of the normal interval. The worker replies with the number of
    // messages dispatched once the scan finishes.
    Scan(oneshot::Sender<Result<usize, LogError>>),
    // Stop the scan loop
    Shutdown,
}

/// Tails the release message log and hands every new message, in id order, to
/// the registered listeners. This is the only dispatch path, so listeners see
/// messages one at a time.
pub struct ReleaseMessageScanner {
    log: Arc<dyn ReleaseMessageLog>,
    listeners: Vec<Arc<dyn ReleaseMessageListener>>,
    topic: String,
    interval: Duration,
    batch_size: usize,
    // Set once the starting position in the log is known
    ready: Arc<AtomicBool>,
}

impl ReleaseMessageScanner {
    pub fn new(log: Arc<dyn ReleaseMessageLog>, config: &ScannerConfig) -> Self {
        ReleaseMessageScanner {
            log,
            listeners: Vec::new(),
            topic: config.topic.clone(),
            interval: config.interval(),
            batch_size: config.batch_size.max(1),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ReleaseMessageListener>) {
        self.listeners.push(listener);
    }

    pub fn spawn(self) -> ScannerHandle {
        // Channel to send commands to the scan loop.
        let (tx, rx) = mpsc::channel::<Command>(64);
        let ready = self.ready.clone();
        tokio::spawn(self.run(rx));
        ScannerHandle { tx, ready }
    }

    /// Starts from the current end of the log; history is never replayed since
    /// polls compare against the log directly.
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        let mut cursor = loop {
            match self.log.max_message_id().await {
                Ok(id) => break id,
                Err(err) => {
                    counter!(SCANNER_ERRORS).increment(1);
                    tracing::error!(error = %err, "could not read the log head, retrying");
                    sleep(self.interval).await;
                }
            }
        };
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!(cursor, topic = %self.topic, "release message scanner started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.scan(&mut cursor).await {
                        counter!(SCANNER_ERRORS).increment(1);
                        tracing::error!(error = %err, cursor, "scan failed");
                    }
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::Scan(reply)) => {
                        let _ = reply.send(self.scan(&mut cursor).await);
                    }
                    Some(Command::Shutdown) | None => break,
                }
            }
        }
        tracing::info!(cursor, "release message scanner stopped");
    }

    /// Dispatches everything after `cursor`. The cursor only moves past messages
    /// that were handed out, so a failed read is retried on the next round.
    async fn scan(&self, cursor: &mut i64) -> Result<usize, LogError> {
        let mut dispatched = 0;
        loop {
            let messages = self
                .log
                .find_messages_after(*cursor, self.batch_size)
                .await?;
            let fetched = messages.len();

            for message in &messages {
                for listener in &self.listeners {
                    listener.handle_message(message, &self.topic);
                }
                *cursor = message.id;
            }
            dispatched += fetched;

            if fetched < self.batch_size {
                return Ok(dispatched);
            }
        }
    }
}

#[derive(Clone)]
pub struct ScannerHandle {
    tx: mpsc::Sender<Command>,
    ready: Arc<AtomicBool>,
}

impl ScannerHandle {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Scans immediately and waits for the dispatch to finish.
    pub async fn scan_now(&self) -> Result<usize, ScannerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Scan(reply_tx))
            .await
            .map_err(|_| ScannerError::Stopped)?;
        Ok(reply_rx.await.map_err(|_| ScannerError::Stopped)??)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_log::InMemoryReleaseMessageLog;
    use crate::types::ReleaseMessage;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        seen: Mutex<Vec<(i64, String, String)>>,
    }

    impl ReleaseMessageListener for RecordingListener {
        fn handle_message(&self, message: &ReleaseMessage, channel: &str) {
            self.seen
                .lock()
                .push((message.id, message.content.clone(), channel.to_string()));
        }
    }

    fn start(
        log: Arc<InMemoryReleaseMessageLog>,
        batch_size: usize,
    ) -> (ScannerHandle, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let mut scanner = ReleaseMessageScanner::new(
            log,
            &ScannerConfig {
                interval_ms: 60_000,
                batch_size,
                topic: "topic".into(),
            },
        );
        scanner.add_listener(listener.clone());
        (scanner.spawn(), listener)
    }

    #[tokio::test]
    async fn test_dispatches_new_messages_in_order() {
        let log = Arc::new(InMemoryReleaseMessageLog::new());
        let (handle, listener) = start(log.clone(), 2);

        assert_eq!(handle.scan_now().await.unwrap(), 0);
        assert!(handle.is_ready());

        for ns in ["a", "b", "c", "d", "e"] {
            log.append(&format!("app+default+{ns}")).await.unwrap();
        }
        // Batch size 2 means several reads in one scan
        assert_eq!(handle.scan_now().await.unwrap(), 5);
        assert_eq!(handle.scan_now().await.unwrap(), 0);

        let seen = listener.seen.lock().clone();
        let ids: Vec<i64> = seen.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(seen[2].1, "app+default+c");
        assert!(seen.iter().all(|(_, _, channel)| channel == "topic"));
    }

    #[tokio::test]
    async fn test_history_is_not_replayed() {
        let log = Arc::new(InMemoryReleaseMessageLog::new());
        log.append("app+default+old").await.unwrap();

        let (handle, listener) = start(log.clone(), 10);
        assert_eq!(handle.scan_now().await.unwrap(), 0);

        log.append("app+default+new").await.unwrap();
        assert_eq!(handle.scan_now().await.unwrap(), 1);
        assert_eq!(listener.seen.lock()[0].1, "app+default+new");
    }

    #[tokio::test]
    async fn test_shutdown() {
        let log = Arc::new(InMemoryReleaseMessageLog::new());
        let (handle, _listener) = start(log, 10);
        handle.shutdown().await;

        // Wait for the loop to drop its receiver
        let mut stopped = false;
        for _ in 0..50 {
            if matches!(handle.scan_now().await, Err(ScannerError::Stopped)) {
                stopped = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(stopped);
    }
}
