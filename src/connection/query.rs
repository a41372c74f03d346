use std::mem;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{Connection, ConnectionState, StateTag};
use crate::error::{PgWireError, Result};
use crate::protocol::backend::{BackendMessage, DataRow, RowDescription};
use crate::protocol::frontend::{Format, FrontendMessage, Oid, Target};

/// Outcome of one statement or one extended-query step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Column layout, if the statement returns rows (or was described).
    pub fields: Option<RowDescription>,
    /// Parameter types reported by a statement Describe.
    pub param_types: Option<Vec<Oid>>,
    pub rows: Vec<DataRow>,
    /// CommandComplete tag, e.g. `SELECT 3`. `None` for an empty query.
    pub command_tag: Option<String>,
    /// Execute stopped at `max_rows`; the portal can be executed again.
    pub suspended: bool,
}

impl QueryResult {
    /// Row count from the command tag (`INSERT 0 5` -> 5).
    pub fn rows_affected(&self) -> Option<u64> {
        self.command_tag
            .as_deref()?
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
    }

    fn is_blank(&self) -> bool {
        self.fields.is_none()
            && self.param_types.is_none()
            && self.rows.is_empty()
            && self.command_tag.is_none()
    }
}

/// Reply the server owes for one queued extended-query message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pending {
    Parse,
    Bind,
    DescribeStatement,
    DescribePortal,
    Execute,
    Close,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Run a simple query and collect one result per statement.
    ///
    /// A server error is returned as [`PgWireError::Server`]; the connection
    /// stays `Ready`.
    pub async fn query(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        self.ensure_state("query", StateTag::Ready)?;
        FrontendMessage::Query { sql }.validate()?;
        debug!(sql, "simple query");
        let res = self.query_inner(sql).await;
        self.check(res)
    }

    async fn query_inner(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        let stream = self.io()?;
        stream.send(FrontendMessage::Query { sql });
        stream.flush().await?;
        self.drain_until_ready().await
    }

    /// Queue a Parse. Sent on the next [`flush`](Self::flush) or [`sync`](Self::sync).
    pub fn parse(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> Result<()> {
        self.queue(
            "parse",
            FrontendMessage::Parse {
                name,
                sql,
                param_types,
            },
            Pending::Parse,
        )
    }

    /// Queue a Bind of `statement` into `portal`. `None` params are NULL.
    pub fn bind(
        &mut self,
        portal: &str,
        statement: &str,
        params: &[Option<&[u8]>],
        param_formats: &[Format],
        result_formats: &[Format],
    ) -> Result<()> {
        self.queue(
            "bind",
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            },
            Pending::Bind,
        )
    }

    pub fn describe_statement(&mut self, name: &str) -> Result<()> {
        self.queue(
            "describe",
            FrontendMessage::Describe {
                target: Target::Statement,
                name,
            },
            Pending::DescribeStatement,
        )
    }

    pub fn describe_portal(&mut self, name: &str) -> Result<()> {
        self.queue(
            "describe",
            FrontendMessage::Describe {
                target: Target::Portal,
                name,
            },
            Pending::DescribePortal,
        )
    }

    /// Queue an Execute. `max_rows` zero fetches everything.
    pub fn execute(&mut self, portal: &str, max_rows: u32) -> Result<()> {
        self.queue(
            "execute",
            FrontendMessage::Execute { portal, max_rows },
            Pending::Execute,
        )
    }

    pub fn close_statement(&mut self, name: &str) -> Result<()> {
        self.queue(
            "close",
            FrontendMessage::Close {
                target: Target::Statement,
                name,
            },
            Pending::Close,
        )
    }

    pub fn close_portal(&mut self, name: &str) -> Result<()> {
        self.queue(
            "close",
            FrontendMessage::Close {
                target: Target::Portal,
                name,
            },
            Pending::Close,
        )
    }

    fn queue(&mut self, op: &'static str, msg: FrontendMessage<'_>, reply: Pending) -> Result<()> {
        self.ensure_state(op, StateTag::Ready)?;
        msg.validate()?;
        self.io()?.send(msg);
        self.pending.push_back(reply);
        Ok(())
    }

    /// Send a Flush and collect the replies to everything queued so far.
    ///
    /// Results are returned for Describe and Execute steps, in order. On a
    /// server error the server skips ahead to the next Sync, so the caller
    /// must [`sync`](Self::sync) before issuing more work.
    pub async fn flush(&mut self) -> Result<Vec<QueryResult>> {
        self.ensure_state("flush", StateTag::Ready)?;
        let res = self.flush_inner().await;
        self.check(res)
    }

    async fn flush_inner(&mut self) -> Result<Vec<QueryResult>> {
        let stream = self.io()?;
        stream.send(FrontendMessage::Flush);
        stream.flush().await?;
        self.drain_pending().await
    }

    /// Send a Sync and read through ReadyForQuery, ending the implicit
    /// transaction of the extended-query cycle.
    pub async fn sync(&mut self) -> Result<Vec<QueryResult>> {
        self.ensure_state("sync", StateTag::Ready)?;
        let res = self.sync_inner().await;
        self.check(res)
    }

    async fn sync_inner(&mut self) -> Result<Vec<QueryResult>> {
        let stream = self.io()?;
        stream.send(FrontendMessage::Sync);
        stream.flush().await?;
        self.drain_until_ready().await
    }

    async fn drain_pending(&mut self) -> Result<Vec<QueryResult>> {
        let mut results = Vec::new();
        let mut current = QueryResult::default();

        while let Some(&expected) = self.pending.front() {
            let done = match (expected, self.recv().await?) {
                (_, BackendMessage::ErrorResponse(fields)) => {
                    self.pending.clear();
                    return Err(PgWireError::Server(fields));
                }
                (Pending::Parse, BackendMessage::ParseComplete)
                | (Pending::Bind, BackendMessage::BindComplete)
                | (Pending::Close, BackendMessage::CloseComplete) => true,
                (Pending::DescribeStatement, BackendMessage::ParameterDescription(types)) => {
                    current.param_types = Some(types);
                    false
                }
                (
                    Pending::DescribeStatement | Pending::DescribePortal,
                    BackendMessage::RowDescription(desc),
                ) => {
                    current.fields = Some(desc);
                    results.push(mem::take(&mut current));
                    true
                }
                (Pending::DescribeStatement | Pending::DescribePortal, BackendMessage::NoData) => {
                    results.push(mem::take(&mut current));
                    true
                }
                (Pending::Execute, BackendMessage::DataRow(row)) => {
                    current.rows.push(row);
                    false
                }
                (Pending::Execute, BackendMessage::CommandComplete { tag }) => {
                    current.command_tag = Some(tag);
                    results.push(mem::take(&mut current));
                    true
                }
                (Pending::Execute, BackendMessage::EmptyQueryResponse) => {
                    results.push(mem::take(&mut current));
                    true
                }
                (Pending::Execute, BackendMessage::PortalSuspended) => {
                    current.suspended = true;
                    results.push(mem::take(&mut current));
                    true
                }
                (expected, other) => {
                    return Err(PgWireError::protocol(format!(
                        "unexpected {} while awaiting reply to {expected:?}",
                        other.name()
                    )));
                }
            };
            if done {
                self.pending.pop_front();
            }
        }
        Ok(results)
    }

    /// Read replies until ReadyForQuery. The first server error seen is
    /// returned after the connection is back to idle.
    pub(crate) async fn drain_until_ready(&mut self) -> Result<Vec<QueryResult>> {
        let mut results = Vec::new();
        let mut current = QueryResult::default();
        let mut error = None;

        loop {
            match self.recv().await? {
                BackendMessage::RowDescription(desc) => current.fields = Some(desc),
                BackendMessage::ParameterDescription(types) => current.param_types = Some(types),
                BackendMessage::DataRow(row) => current.rows.push(row),
                BackendMessage::CommandComplete { tag } => {
                    current.command_tag = Some(tag);
                    results.push(mem::take(&mut current));
                }
                BackendMessage::EmptyQueryResponse => results.push(mem::take(&mut current)),
                BackendMessage::PortalSuspended => {
                    current.suspended = true;
                    results.push(mem::take(&mut current));
                }
                BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::CloseComplete
                | BackendMessage::NoData => {}
                BackendMessage::ErrorResponse(fields) => {
                    debug!(error = %fields, "server error, waiting for ready");
                    error.get_or_insert(fields);
                    current = QueryResult::default();
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.transaction_status = status;
                    self.pending.clear();
                    if !current.is_blank() {
                        results.push(current);
                    }
                    if self.state.tag() != StateTag::Ready {
                        self.transition(ConnectionState::Ready);
                    }
                    break;
                }
                other => {
                    return Err(PgWireError::protocol(format!(
                        "unexpected {} in {} state",
                        other.name(),
                        self.state.tag()
                    )));
                }
            }
        }

        match error {
            Some(fields) => Err(PgWireError::Server(fields)),
            None => Ok(results),
        }
    }
}
