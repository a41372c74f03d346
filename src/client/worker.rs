use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ReplicationConfig;
use crate::connection::Connection;
use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;
use crate::replication::{FetchStatus, ReplicationStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    KeepAlive {
        wal_end: Lsn,
        reply_requested: bool,
        server_time_micros: i64,
    },
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_time_micros: i64,
        data: Bytes,
    },

    /// Emitted when the worker reaches `stop_at_lsn`. Evaluated against the
    /// WAL end reported with each data frame.
    StoppedAt { reached: Lsn },

    /// The server ended the stream.
    Closed,
}

pub type ReplicationEventReceiver =
    mpsc::Receiver<std::result::Result<ReplicationEvent, PgWireError>>;

pub struct WorkerState {
    cfg: ReplicationConfig,
    applied_rx: watch::Receiver<Lsn>,
    stop_rx: watch::Receiver<bool>,
    out: mpsc::Sender<std::result::Result<ReplicationEvent, PgWireError>>,
}

/// Whether the worker should keep streaming after forwarding an event.
enum Flow {
    Continue,
    Stop,
}

impl WorkerState {
    pub fn new(
        cfg: ReplicationConfig,
        applied_rx: watch::Receiver<Lsn>,
        stop_rx: watch::Receiver<bool>,
        out: mpsc::Sender<std::result::Result<ReplicationEvent, PgWireError>>,
    ) -> Self {
        Self {
            cfg,
            applied_rx,
            stop_rx,
            out,
        }
    }

    /// Start replication on a `Ready` connection and forward events until
    /// stopped, the stop LSN is reached or the server ends the stream. The
    /// connection is `Ready` again on success.
    pub async fn run_on_connection<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        conn: &mut Connection<S>,
    ) -> Result<()> {
        let plugin_options: Vec<(&str, &str)> = self
            .cfg
            .plugin_options
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let mut stream = conn
            .start_replication(
                &self.cfg.slot,
                self.cfg.start_lsn,
                self.cfg.stream_options(),
                &plugin_options,
            )
            .await?;

        let res = self.pump(&mut stream).await;
        if res.is_err() {
            return res;
        }
        stream.close().await
    }

    async fn pump<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: &mut ReplicationStream<'_, S>,
    ) -> Result<()> {
        let mut last_message = Instant::now();

        loop {
            if *self.stop_rx.borrow() {
                info!("replication stop requested");
                return Ok(());
            }

            let applied = *self.applied_rx.borrow();
            if applied.is_valid() {
                stream.confirm(applied);
            }
            // periodic feedback doubles as a liveness signal, so it is sent
            // even when positions did not move
            if stream.status_due() {
                stream.flush(true).await?;
            }

            match stream.fetch_next().await? {
                FetchStatus::None => {
                    if last_message.elapsed() >= self.cfg.idle_timeout {
                        return Err(PgWireError::Io(format!(
                            "replication idle timeout: no message for {:?}",
                            self.cfg.idle_timeout
                        )));
                    }
                }
                FetchStatus::KeepAlive => {
                    last_message = Instant::now();
                    if let Some(ka) = stream.last_keepalive() {
                        let ev = ReplicationEvent::KeepAlive {
                            wal_end: ka.end_lsn,
                            reply_requested: ka.reply_immediately,
                            server_time_micros: ka.server_clock,
                        };
                        if let Flow::Stop = self.emit(ev).await {
                            return Ok(());
                        }
                    }
                }
                FetchStatus::Data => {
                    last_message = Instant::now();
                    let Some(header) = stream.last_data() else {
                        return Err(PgWireError::Internal("data without header".into()));
                    };
                    let data = stream.read_data().await?;
                    let ev = ReplicationEvent::XLogData {
                        wal_start: header.start_lsn,
                        wal_end: header.end_lsn,
                        server_time_micros: header.server_clock,
                        data,
                    };
                    if let Flow::Stop = self.emit(ev).await {
                        return Ok(());
                    }

                    if let Some(stop) = self.cfg.stop_at_lsn
                        && header.end_lsn >= stop
                    {
                        info!(reached = %header.end_lsn, %stop, "stop LSN reached");
                        self.emit(ReplicationEvent::StoppedAt {
                            reached: header.end_lsn,
                        })
                        .await;
                        return Ok(());
                    }
                }
                FetchStatus::Closed => {
                    self.emit(ReplicationEvent::Closed).await;
                    return Ok(());
                }
            }
        }
    }

    async fn emit(&self, ev: ReplicationEvent) -> Flow {
        if self.out.send(Ok(ev)).await.is_err() {
            debug!("event receiver dropped, stopping");
            return Flow::Stop;
        }
        Flow::Continue
    }

    /// Forward a terminal error to the consumer.
    pub async fn report(&self, err: PgWireError) {
        let _ = self.out.send(Err(err)).await;
    }
}
