use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::{ReplicationSession, ReplicationStream};
use crate::config::ReplicationOptions;
use crate::connection::{Connection, ConnectionState, QueryResult, StateTag};
use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;
use crate::protocol::backend::{BackendMessage, DataRow};
use crate::protocol::frontend::FrontendMessage;

/// Row returned by CREATE_REPLICATION_SLOT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub slot_name: String,
    /// First LSN the slot can stream from.
    pub consistent_point: Lsn,
    pub snapshot_name: Option<String>,
    pub output_plugin: Option<String>,
}

/// Row returned by IDENTIFY_SYSTEM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: u32,
    /// Current WAL flush position.
    pub xlog_pos: Lsn,
    pub dbname: Option<String>,
}

/// Double-quote an identifier for a replication command.
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a literal for a replication command.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn start_replication_sql(slot: &str, start_lsn: Lsn, plugin_options: &[(&str, &str)]) -> String {
    let mut sql = format!(
        "START_REPLICATION SLOT {} LOGICAL {start_lsn}",
        quote_identifier(slot)
    );
    if !plugin_options.is_empty() {
        let opts: Vec<String> = plugin_options
            .iter()
            .map(|(k, v)| format!("{} {}", quote_identifier(k), quote_literal(v)))
            .collect();
        sql.push_str(&format!(" ({})", opts.join(", ")));
    }
    sql
}

fn single_row<'r>(results: &'r [QueryResult], command: &str) -> Result<&'r DataRow> {
    results
        .iter()
        .find_map(|r| r.rows.first())
        .ok_or_else(|| PgWireError::protocol(format!("{command} returned no row")))
}

fn required<'r>(row: &'r DataRow, idx: usize, command: &str) -> Result<&'r str> {
    row.get_text(idx)?
        .ok_or_else(|| PgWireError::protocol(format!("{command}: column {idx} is NULL")))
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Start logical replication from `slot` at `start_lsn`.
    ///
    /// On success the connection is `ReplicationStreaming` and the returned
    /// handle drives the stream. A server error (unknown slot, wrong
    /// connection mode) leaves the connection `Ready`.
    pub async fn start_replication(
        &mut self,
        slot: &str,
        start_lsn: Lsn,
        options: ReplicationOptions,
        plugin_options: &[(&str, &str)],
    ) -> Result<ReplicationStream<'_, S>> {
        self.ensure_state("start replication", StateTag::Ready)?;
        let sql = start_replication_sql(slot, start_lsn, plugin_options);
        FrontendMessage::Query { sql: &sql }.validate()?;
        let res = self.start_replication_inner(&sql).await;
        self.check(res)?;

        info!(slot, %start_lsn, "replication started");
        self.transition(ConnectionState::ReplicationStreaming(ReplicationSession::new(
            slot, start_lsn, options,
        )));
        Ok(ReplicationStream::new(self))
    }

    async fn start_replication_inner(&mut self, sql: &str) -> Result<()> {
        debug!(sql, "start replication");
        let stream = self.io()?;
        stream.send(FrontendMessage::Query { sql });
        stream.flush().await?;

        match self.recv().await? {
            BackendMessage::CopyBothResponse(_) => Ok(()),
            BackendMessage::ErrorResponse(fields) => {
                // the server returns to idle after the error
                match self.drain_until_ready().await {
                    Ok(_) | Err(PgWireError::Server(_)) => {}
                    Err(e) => return Err(e),
                }
                Err(PgWireError::Server(fields))
            }
            other => Err(PgWireError::protocol(format!(
                "expected CopyBothResponse, got {}",
                other.name()
            ))),
        }
    }

    /// Handle on the replication session that is already running.
    pub fn replication_stream(&mut self) -> Result<ReplicationStream<'_, S>> {
        self.ensure_state("resume replication", StateTag::ReplicationStreaming)?;
        Ok(ReplicationStream::new(self))
    }

    /// CREATE_REPLICATION_SLOT for logical decoding with `plugin`.
    pub async fn create_replication_slot(
        &mut self,
        slot: &str,
        plugin: &str,
    ) -> Result<ReplicationSlot> {
        let sql = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL {}",
            quote_identifier(slot),
            quote_identifier(plugin)
        );
        let results = self.query(&sql).await?;
        let row = single_row(&results, "CREATE_REPLICATION_SLOT")?;
        Ok(ReplicationSlot {
            slot_name: required(row, 0, "CREATE_REPLICATION_SLOT")?.to_string(),
            consistent_point: Lsn::parse(required(row, 1, "CREATE_REPLICATION_SLOT")?)?,
            snapshot_name: row.get_text(2)?.map(str::to_string),
            output_plugin: row.get_text(3)?.map(str::to_string),
        })
    }

    pub async fn drop_replication_slot(&mut self, slot: &str) -> Result<()> {
        let sql = format!("DROP_REPLICATION_SLOT {}", quote_identifier(slot));
        self.query(&sql).await?;
        Ok(())
    }

    pub async fn identify_system(&mut self) -> Result<SystemIdentity> {
        let results = self.query("IDENTIFY_SYSTEM").await?;
        let row = single_row(&results, "IDENTIFY_SYSTEM")?;
        let timeline = required(row, 1, "IDENTIFY_SYSTEM")?;
        Ok(SystemIdentity {
            system_id: required(row, 0, "IDENTIFY_SYSTEM")?.to_string(),
            timeline: timeline.parse().map_err(|_| {
                PgWireError::protocol(format!("IDENTIFY_SYSTEM: bad timeline {timeline:?}"))
            })?,
            xlog_pos: Lsn::parse(required(row, 2, "IDENTIFY_SYSTEM")?)?,
            dbname: row.get_text(3)?.map(str::to_string),
        })
    }
}
