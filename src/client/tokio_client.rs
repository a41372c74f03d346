use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ReplicationConfig;
use crate::connection::Connection;
use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;

use super::worker::{ReplicationEvent, ReplicationEventReceiver, WorkerState};

/// Handle on a replication worker task.
///
/// Dropping the handle drops the event receiver; the worker notices on its
/// next event and shuts the session down.
pub struct ReplicationClient {
    events: ReplicationEventReceiver,
    applied: watch::Sender<Lsn>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReplicationClient {
    /// Connect over TCP and start streaming on a worker task.
    ///
    /// Connection failures are delivered through [`recv`](Self::recv), not
    /// returned here.
    pub async fn connect(cfg: ReplicationConfig) -> Result<Self> {
        Ok(Self::spawn(cfg, |cfg| async move {
            Connection::connect(&cfg.connection).await
        }))
    }

    /// Start streaming on a connection the caller already opened, e.g. one
    /// running over a TLS stream. `conn` must be a `Ready` connection opened
    /// in logical replication mode.
    pub fn spawn_on<S>(cfg: ReplicationConfig, conn: Connection<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(cfg, |_| async move { Ok(conn) })
    }

    fn spawn<S, F, Fut>(cfg: ReplicationConfig, open: F) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: FnOnce(ReplicationConfig) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Connection<S>>> + Send + 'static,
    {
        let (event_tx, events) = mpsc::channel(cfg.buffer_events.max(1));
        let (applied, applied_rx) = watch::channel(cfg.start_lsn);
        let (stop, stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut worker = WorkerState::new(cfg.clone(), applied_rx, stop_rx, event_tx);
            let res = match open(cfg).await {
                Ok(mut conn) => {
                    let res = worker.run_on_connection(&mut conn).await;
                    conn.close().await;
                    res
                }
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                tracing::error!(error = %e, "replication worker failed");
                worker.report(e).await;
            }
        });

        Self {
            events,
            applied,
            stop,
            task,
        }
    }

    /// Next event from the worker. Fails with the worker's error, or with
    /// [`PgWireError::Task`] once the worker is gone and the channel drained.
    pub async fn recv(&mut self) -> Result<ReplicationEvent> {
        self.events.recv().await.unwrap_or_else(|| {
            Err(PgWireError::Task(
                "replication worker channel closed".into(),
            ))
        })
    }

    /// Report `lsn` as applied. The worker confirms it on the stream, so the
    /// next status update carries it as the flushed and applied position.
    pub fn update_applied_lsn(&self, lsn: Lsn) {
        self.applied.send_replace(lsn);
    }

    /// Ask the worker to end the session. Events already queued can still
    /// be received.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait for the worker task to finish.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| PgWireError::Task(format!("join error: {e}")))
    }
}
