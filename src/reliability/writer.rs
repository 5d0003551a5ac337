//! Persistence off the decision path. A dedicated thread owns the sink and
//! applies queued writes in order; callers only ever enqueue.
//!
//! Dropping the writer closes the queue and waits for the backlog, so a
//! restarted process sees every write the previous one accepted.

use anyhow::Result;
use serde::Serialize;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

use crate::logging::{self, Domain, Level};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub written: u64,
    pub failed: u64,
}

pub struct BackgroundWriter<M: Send + 'static> {
    name: &'static str,
    tx: Option<mpsc::UnboundedSender<M>>,
    handle: Option<JoinHandle<WriterStats>>,
}

impl<M: Send + 'static> BackgroundWriter<M> {
    /// Spawn the writer thread. `apply` runs once per message, in submit
    /// order. Its failures are logged and counted, never returned.
    pub fn spawn<F>(name: &'static str, domain: Domain, mut apply: F) -> Result<Self>
    where
        F: FnMut(M) -> Result<()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<M>();
        let handle = thread::Builder::new().name(format!("{}-writer", name)).spawn(move || {
            let mut stats = WriterStats::default();
            while let Some(msg) = rx.blocking_recv() {
                match apply(msg) {
                    Ok(()) => stats.written += 1,
                    Err(err) => {
                        stats.failed += 1;
                        logging::log(
                            Level::Warn,
                            domain,
                            "write_failed",
                            logging::obj(&[("writer", logging::v_str(name)), ("error", logging::v_str(&format!("{:#}", err)))]),
                        );
                    }
                }
            }
            logging::log(
                Level::Info,
                domain,
                "writer_stopped",
                logging::obj(&[
                    ("writer", logging::v_str(name)),
                    ("written", serde_json::json!(stats.written)),
                    ("failed", serde_json::json!(stats.failed)),
                ]),
            );
            stats
        })?;
        Ok(Self { name, tx: Some(tx), handle: Some(handle) })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue without waiting on the sink. False once the thread is gone.
    pub fn submit(&self, msg: M) -> bool {
        match &self.tx {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Close the queue and wait for the backlog to drain.
    pub fn shutdown(mut self) -> WriterStats {
        self.close()
    }

    fn close(&mut self) -> WriterStats {
        drop(self.tx.take());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => WriterStats::default(),
        }
    }
}

impl<M: Send + 'static> Drop for BackgroundWriter<M> {
    fn drop(&mut self) {
        self.close();
    }
}
