//! Protocol tests against a scripted in-memory server.
//!
//! Server replies are written into the duplex pipe before the client call
//! that consumes them, so every test runs on one task without timing games.
//! Afterwards the test reads back what the client sent.

use std::time::Duration;

use pgwire_engine::protocol::backend::TransactionStatus;
use pgwire_engine::{
    Connection, ConnectionConfig, FetchStatus, Lsn, PgWireError, ReplicationClient,
    ReplicationConfig, ReplicationEvent, ReplicationMode, ReplicationOptions, StateTag,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

const PIPE: usize = 1 << 16;
const TIMEOUT: Duration = Duration::from_secs(2);

// ---- backend message builders ----

fn msg(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut v = vec![tag];
    v.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
    v.extend_from_slice(payload);
    v
}

fn cstr(v: &mut Vec<u8>, s: &str) {
    v.extend_from_slice(s.as_bytes());
    v.push(0);
}

fn auth(code: i32, extra: &[u8]) -> Vec<u8> {
    let mut p = code.to_be_bytes().to_vec();
    p.extend_from_slice(extra);
    msg(b'R', &p)
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut p = Vec::new();
    cstr(&mut p, name);
    cstr(&mut p, value);
    msg(b'S', &p)
}

fn ready(status: u8) -> Vec<u8> {
    msg(b'Z', &[status])
}

fn row_description(names: &[&str]) -> Vec<u8> {
    let mut p = (names.len() as i16).to_be_bytes().to_vec();
    for name in names {
        cstr(&mut p, name);
        p.extend_from_slice(&0u32.to_be_bytes()); // table oid
        p.extend_from_slice(&0i16.to_be_bytes()); // column attr
        p.extend_from_slice(&25u32.to_be_bytes()); // text
        p.extend_from_slice(&(-1i16).to_be_bytes());
        p.extend_from_slice(&(-1i32).to_be_bytes());
        p.extend_from_slice(&0i16.to_be_bytes());
    }
    msg(b'T', &p)
}

fn data_row(cols: &[Option<&str>]) -> Vec<u8> {
    let mut p = (cols.len() as i16).to_be_bytes().to_vec();
    for col in cols {
        match col {
            Some(v) => {
                p.extend_from_slice(&(v.len() as i32).to_be_bytes());
                p.extend_from_slice(v.as_bytes());
            }
            None => p.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }
    msg(b'D', &p)
}

fn command_complete(tag: &str) -> Vec<u8> {
    let mut p = Vec::new();
    cstr(&mut p, tag);
    msg(b'C', &p)
}

fn error_response(code: &str, message: &str) -> Vec<u8> {
    let mut p = Vec::new();
    for (field, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', code), (b'M', message)] {
        p.push(field);
        cstr(&mut p, value);
    }
    p.push(0);
    msg(b'E', &p)
}

fn copy_both() -> Vec<u8> {
    msg(b'W', &[0, 0, 0])
}

fn copy_done() -> Vec<u8> {
    msg(b'c', &[])
}

fn xlog_data(start: u64, end: u64, clock: i64, body: &[u8]) -> Vec<u8> {
    let mut p = vec![b'w'];
    p.extend_from_slice(&start.to_be_bytes());
    p.extend_from_slice(&end.to_be_bytes());
    p.extend_from_slice(&clock.to_be_bytes());
    p.extend_from_slice(body);
    msg(b'd', &p)
}

fn keepalive(end: u64, clock: i64, flag: u8) -> Vec<u8> {
    let mut p = vec![b'k'];
    p.extend_from_slice(&end.to_be_bytes());
    p.extend_from_slice(&clock.to_be_bytes());
    p.push(flag);
    msg(b'd', &p)
}

// ---- scripted server ----

struct MockServer {
    io: DuplexStream,
}

impl MockServer {
    async fn push(&mut self, frames: &[Vec<u8>]) {
        for f in frames {
            self.io.write_all(f).await.unwrap();
        }
    }

    async fn read_startup(&mut self) -> Vec<u8> {
        let len = tokio::time::timeout(TIMEOUT, self.io.read_i32()).await.unwrap().unwrap();
        let mut body = vec![0u8; len as usize - 4];
        self.io.read_exact(&mut body).await.unwrap();
        body
    }

    async fn read_msg(&mut self) -> (u8, Vec<u8>) {
        let tag = tokio::time::timeout(TIMEOUT, self.io.read_u8()).await.unwrap().unwrap();
        let len = self.io.read_i32().await.unwrap();
        let mut body = vec![0u8; len as usize - 4];
        self.io.read_exact(&mut body).await.unwrap();
        (tag, body)
    }

    /// Read client messages until the client hangs up.
    async fn read_to_end(&mut self) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        loop {
            let tag = match tokio::time::timeout(TIMEOUT, self.io.read_u8()).await.unwrap() {
                Ok(tag) => tag,
                Err(_) => return out,
            };
            let len = self.io.read_i32().await.unwrap();
            let mut body = vec![0u8; len as usize - 4];
            self.io.read_exact(&mut body).await.unwrap();
            out.push((tag, body));
        }
    }
}

fn config(mode: ReplicationMode) -> ConnectionConfig {
    ConnectionConfig::new("mock", "postgres", "secret", "appdb").with_replication(mode)
}

/// Handshake with trust authentication.
async fn connect(mode: ReplicationMode) -> (Connection<DuplexStream>, MockServer) {
    let (client, server) = duplex(PIPE);
    let mut server = MockServer { io: server };
    let mut key = 4242i32.to_be_bytes().to_vec();
    key.extend_from_slice(&7i32.to_be_bytes());
    server
        .push(&[
            auth(0, &[]),
            parameter_status("server_version", "16.4"),
            msg(b'K', &key),
            ready(b'I'),
        ])
        .await;

    let conn = Connection::handshake(client, &config(mode)).await.unwrap();
    server.read_startup().await;
    (conn, server)
}

fn options() -> ReplicationOptions {
    ReplicationOptions {
        poll_timeout: Duration::ZERO,
        status_interval: Duration::from_secs(3600),
    }
}

fn lsn_at(body: &[u8], offset: usize) -> Lsn {
    Lsn(u64::from_be_bytes(body[offset..offset + 8].try_into().unwrap()))
}

// ---- startup ----

#[tokio::test]
async fn handshake_sends_startup_and_collects_session_data() {
    let (client, server) = duplex(PIPE);
    let mut server = MockServer { io: server };
    let mut key = 99i32.to_be_bytes().to_vec();
    key.extend_from_slice(&12345i32.to_be_bytes());
    server
        .push(&[
            auth(0, &[]),
            parameter_status("server_version", "16.4"),
            parameter_status("client_encoding", "UTF8"),
            msg(b'K', &key),
            ready(b'I'),
        ])
        .await;

    let conn = Connection::handshake(client, &config(ReplicationMode::Logical))
        .await
        .unwrap();
    assert_eq!(conn.state(), StateTag::Ready);
    assert_eq!(conn.parameter("server_version"), Some("16.4"));
    let key = conn.backend_key().unwrap();
    assert_eq!((key.process_id, key.secret_key), (99, 12345));
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    assert_eq!(conn.protocol_version(), (3, 0));

    let startup = server.read_startup().await;
    assert_eq!(&startup[..4], &196_608i32.to_be_bytes());
    let text = String::from_utf8_lossy(&startup[4..]);
    assert!(text.contains("user\0postgres\0"));
    assert!(text.contains("database\0appdb\0"));
    assert!(text.contains("replication\0database\0"));
}

#[tokio::test]
async fn cleartext_password_is_sent_on_request() {
    let (client, server) = duplex(PIPE);
    let mut server = MockServer { io: server };
    server.push(&[auth(3, &[]), auth(0, &[]), ready(b'I')]).await;

    let conn = Connection::handshake(client, &config(ReplicationMode::None))
        .await
        .unwrap();
    assert_eq!(conn.state(), StateTag::Ready);

    server.read_startup().await;
    let (tag, body) = server.read_msg().await;
    assert_eq!(tag, b'p');
    assert_eq!(body, b"secret\0");
}

#[tokio::test]
async fn unsupported_auth_method_fails_handshake() {
    let (client, server) = duplex(PIPE);
    let mut server = MockServer { io: server };
    server.push(&[auth(7, &[])]).await; // GSSAPI

    let err = Connection::handshake(client, &config(ReplicationMode::None))
        .await
        .unwrap_err();
    assert!(err.is_auth(), "{err}");
}

#[tokio::test]
async fn startup_error_response_is_reported() {
    let (client, server) = duplex(PIPE);
    let mut server = MockServer { io: server };
    server
        .push(&[error_response("28P01", "password authentication failed")])
        .await;

    let err = Connection::handshake(client, &config(ReplicationMode::None))
        .await
        .unwrap_err();
    assert_eq!(err.sqlstate(), Some("28P01"));
}

#[tokio::test]
async fn server_hangup_during_startup_is_an_io_error() {
    let (client, server) = duplex(PIPE);
    drop(server);
    let err = Connection::handshake(client, &config(ReplicationMode::None))
        .await
        .unwrap_err();
    assert!(err.is_io(), "{err}");
}

// ---- simple and extended query ----

#[tokio::test]
async fn simple_query_collects_rows_per_statement() {
    let (mut conn, mut server) = connect(ReplicationMode::None).await;
    server
        .push(&[
            row_description(&["id", "name"]),
            data_row(&[Some("1"), Some("alice")]),
            data_row(&[Some("2"), None]),
            command_complete("SELECT 2"),
            command_complete("CREATE TABLE"),
            ready(b'I'),
        ])
        .await;

    let results = conn.query("SELECT id, name FROM t; CREATE TABLE x()").await.unwrap();
    assert_eq!(results.len(), 2);
    let select = &results[0];
    assert_eq!(select.fields.as_ref().unwrap().index_of("name"), Some(1));
    assert_eq!(select.rows.len(), 2);
    assert_eq!(select.rows[0].get_text(1).unwrap(), Some("alice"));
    assert_eq!(select.rows[1].get_text(1).unwrap(), None);
    assert_eq!(select.rows_affected(), Some(2));
    assert_eq!(results[1].command_tag.as_deref(), Some("CREATE TABLE"));

    let (tag, body) = server.read_msg().await;
    assert_eq!(tag, b'Q');
    assert_eq!(body, b"SELECT id, name FROM t; CREATE TABLE x()\0");
}

#[tokio::test]
async fn server_error_leaves_connection_ready() {
    let (mut conn, mut server) = connect(ReplicationMode::None).await;
    server
        .push(&[
            error_response("42P01", "relation \"missing\" does not exist"),
            ready(b'I'),
        ])
        .await;

    let err = conn.query("SELECT * FROM missing").await.unwrap_err();
    assert!(err.is_server());
    assert!(!err.is_fatal());
    assert_eq!(err.sqlstate(), Some("42P01"));
    assert_eq!(conn.state(), StateTag::Ready);

    server.push(&[command_complete("SELECT 0"), ready(b'I')]).await;
    let results = conn.query("SELECT 1 WHERE false").await.unwrap();
    assert_eq!(results[0].command_tag.as_deref(), Some("SELECT 0"));
}

#[tokio::test]
async fn async_messages_are_absorbed_mid_query() {
    let (mut conn, mut server) = connect(ReplicationMode::None).await;
    let mut notify = 1i32.to_be_bytes().to_vec();
    cstr(&mut notify, "jobs");
    cstr(&mut notify, "42");
    server
        .push(&[
            msg(b'A', &notify),
            parameter_status("TimeZone", "UTC"),
            command_complete("SET"),
            ready(b'T'),
        ])
        .await;

    conn.query("SET TIME ZONE 'UTC'").await.unwrap();
    assert_eq!(conn.parameter("TimeZone"), Some("UTC"));
    assert_eq!(conn.transaction_status(), TransactionStatus::InTransaction);
}

#[tokio::test]
async fn extended_query_flush_and_sync() {
    let (mut conn, mut server) = connect(ReplicationMode::None).await;

    conn.parse("s1", "SELECT $1::text", &[25]).unwrap();
    conn.bind("", "s1", &[Some(&b"hi"[..])], &[], &[]).unwrap();
    conn.describe_portal("").unwrap();
    conn.execute("", 0).unwrap();

    server
        .push(&[
            msg(b'1', &[]),
            msg(b'2', &[]),
            row_description(&["text"]),
            data_row(&[Some("hi")]),
            command_complete("SELECT 1"),
        ])
        .await;
    let results = conn.flush().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].fields.is_some());
    assert_eq!(results[1].rows[0].get_text(0).unwrap(), Some("hi"));
    assert_eq!(results[1].command_tag.as_deref(), Some("SELECT 1"));

    server.push(&[ready(b'I')]).await;
    assert!(conn.sync().await.unwrap().is_empty());

    let tags: Vec<u8> = [
        server.read_msg().await.0,
        server.read_msg().await.0,
        server.read_msg().await.0,
        server.read_msg().await.0,
        server.read_msg().await.0,
        server.read_msg().await.0,
    ]
    .to_vec();
    assert_eq!(tags, b"PBDEHS");
}

#[tokio::test]
async fn extended_query_error_clears_pending_replies() {
    let (mut conn, mut server) = connect(ReplicationMode::None).await;
    conn.parse("", "SELEC 1", &[]).unwrap();
    conn.bind("", "", &[], &[], &[]).unwrap();
    conn.execute("", 0).unwrap();

    server
        .push(&[error_response("42601", "syntax error at or near \"SELEC\"")])
        .await;
    let err = conn.flush().await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("42601"));
    assert_eq!(conn.state(), StateTag::Ready);

    server.push(&[ready(b'I')]).await;
    conn.sync().await.unwrap();
}

#[tokio::test]
async fn describe_statement_reports_parameter_types() {
    let (mut conn, mut server) = connect(ReplicationMode::None).await;
    conn.parse("s2", "INSERT INTO t VALUES ($1, $2)", &[]).unwrap();
    conn.describe_statement("s2").unwrap();
    conn.close_statement("s2").unwrap();

    let mut types = 2i16.to_be_bytes().to_vec();
    types.extend_from_slice(&23u32.to_be_bytes());
    types.extend_from_slice(&25u32.to_be_bytes());
    server
        .push(&[msg(b'1', &[]), msg(b't', &types), msg(b'n', &[]), msg(b'3', &[])])
        .await;

    let results = conn.flush().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].param_types.as_deref(), Some(&[23, 25][..]));
    assert!(results[0].fields.is_none());
}

#[tokio::test]
async fn portal_suspended_marks_partial_result() {
    let (mut conn, mut server) = connect(ReplicationMode::None).await;
    conn.execute("cursor", 1).unwrap();
    server.push(&[data_row(&[Some("1")]), msg(b's', &[])]).await;

    let results = conn.flush().await.unwrap();
    assert!(results[0].suspended);
    assert_eq!(results[0].rows.len(), 1);
}

#[tokio::test]
async fn unexpected_message_breaks_connection() {
    let (mut conn, mut server) = connect(ReplicationMode::None).await;
    server.push(&[copy_done()]).await;

    let err = conn.query("SELECT 1").await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(conn.state(), StateTag::Broken);
    assert!(!conn.is_usable());

    let err = conn.query("SELECT 1").await.unwrap_err();
    assert!(matches!(
        err,
        PgWireError::ConnectionUnusable(StateTag::Broken)
    ));
}

// ---- close ----

#[tokio::test]
async fn close_sends_terminate_and_makes_connection_unusable() {
    let (mut conn, mut server) = connect(ReplicationMode::None).await;
    conn.close().await;
    assert_eq!(conn.state(), StateTag::Closed);

    let sent = server.read_to_end().await;
    assert_eq!(sent, vec![(b'X', Vec::new())]);

    let err = conn.query("SELECT 1").await.unwrap_err();
    assert!(matches!(
        err,
        PgWireError::ConnectionUnusable(StateTag::Closed)
    ));
    assert!(conn.parse("", "SELECT 1", &[]).is_err());

    // closing twice is harmless
    conn.close().await;
    assert_eq!(conn.state(), StateTag::Closed);
}

#[tokio::test]
async fn close_succeeds_when_terminate_cannot_be_written() {
    let (mut conn, server) = connect(ReplicationMode::None).await;
    drop(server);

    conn.close().await;
    assert_eq!(conn.state(), StateTag::Closed);
    assert!(matches!(
        conn.query("SELECT 1").await.unwrap_err(),
        PgWireError::ConnectionUnusable(StateTag::Closed)
    ));
}

#[tokio::test]
async fn broken_connection_stays_broken_after_close() {
    let (mut conn, mut server) = connect(ReplicationMode::None).await;
    server.push(&[msg(b'?', &[])]).await;
    assert!(conn.query("SELECT 1").await.unwrap_err().is_fatal());

    conn.close().await;
    assert_eq!(conn.state(), StateTag::Broken);
}

// ---- replication ----

#[tokio::test]
async fn fetch_sequence_sends_one_status_update() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    let mut stream = conn
        .start_replication("s1", Lsn::INVALID, options(), &[("proto_version", "1")])
        .await
        .unwrap();

    server
        .push(&[
            xlog_data(0x64, 0x64, 100, b"first"),
            xlog_data(0xC8, 0xC8, 200, b"second"),
            keepalive(0x12C, 300, 1),
        ])
        .await;

    assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::Data);
    assert_eq!(stream.start_lsn(), Lsn::new(0, 0x64));
    // first body is left unread and skipped by the next fetch
    assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::Data);
    assert_eq!(stream.start_lsn(), Lsn::new(0, 0xC8));
    assert_eq!(stream.read_data().await.unwrap().as_ref(), b"second");
    assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::KeepAlive);
    assert_eq!(stream.end_lsn(), Lsn::new(0, 0x12C));
    assert_eq!(stream.server_clock(), 300);
    assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::None);
    assert!(!stream.end_of_stream());

    server.push(&[copy_done()]).await;
    assert_eq!(
        stream.fetch_next_timeout(TIMEOUT).await.unwrap(),
        FetchStatus::Closed
    );
    assert!(stream.end_of_stream());
    assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::Closed);
    assert_eq!(stream.start_lsn(), Lsn::new(0, 0xC8));

    server
        .push(&[command_complete("START_REPLICATION"), ready(b'I')])
        .await;
    stream.close().await.unwrap();
    assert!(stream.end_of_stream());
    assert_eq!(conn.state(), StateTag::Ready);
    conn.close().await;

    let sent = server.read_to_end().await;
    let tags: Vec<u8> = sent.iter().map(|(t, _)| *t).collect();
    assert_eq!(tags, b"QdcX");

    let (_, status) = &sent[1];
    assert_eq!(status.len(), 34);
    assert_eq!(status[0], b'r');
    assert_eq!(lsn_at(status, 1), Lsn::new(0, 0x12C)); // written
    assert_eq!(lsn_at(status, 9), Lsn::new(0, 0xC8)); // flushed
    assert_eq!(lsn_at(status, 17), Lsn::new(0, 0xC8)); // applied
    assert_eq!(status[33], 0);
}

#[tokio::test]
async fn start_replication_command_text() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    let stream = conn
        .start_replication(
            "slot_a",
            Lsn::new(1, 0x10),
            options(),
            &[("publication_names", "p'1")],
        )
        .await
        .unwrap();
    assert_eq!(stream.slot(), "slot_a");
    assert_eq!(stream.start_lsn(), Lsn::new(1, 0x10));

    let (tag, body) = server.read_msg().await;
    assert_eq!(tag, b'Q');
    assert_eq!(
        String::from_utf8(body).unwrap(),
        "START_REPLICATION SLOT \"slot_a\" LOGICAL 00000001/00000010 \
         (\"publication_names\" 'p''1')\0"
    );
}

#[tokio::test]
async fn unforced_flush_is_idempotent() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    let mut stream = conn
        .start_replication("s1", Lsn::new(0, 0x10), options(), &[])
        .await
        .unwrap();

    assert!(stream.flush(false).await.unwrap());
    assert!(!stream.flush(false).await.unwrap());

    stream.confirm(Lsn::new(0, 0x20));
    assert!(stream.flush(false).await.unwrap());
    assert!(!stream.flush(false).await.unwrap());
    assert!(stream.flush(true).await.unwrap());

    drop(stream);
    conn.close().await;
    let sent = server.read_to_end().await;
    let updates: Vec<&Vec<u8>> = sent
        .iter()
        .filter(|(t, _)| *t == b'd')
        .map(|(_, b)| b)
        .collect();
    assert_eq!(updates.len(), 3);
    assert_eq!(lsn_at(updates[0], 9), Lsn::new(0, 0x10));
    assert_eq!(lsn_at(updates[1], 9), Lsn::new(0, 0x20));
}

#[tokio::test]
async fn invalid_keepalive_flag_breaks_connection() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    let mut stream = conn
        .start_replication("s1", Lsn::INVALID, options(), &[])
        .await
        .unwrap();

    server.push(&[keepalive(0x10, 1, 2)]).await;
    let err = stream.fetch_next().await.unwrap_err();
    assert!(matches!(err, PgWireError::InvalidKeepAliveFlag(2)));

    let err = stream.fetch_next().await.unwrap_err();
    assert!(matches!(
        err,
        PgWireError::ConnectionUnusable(StateTag::Broken)
    ));
    drop(stream);
    assert_eq!(conn.state(), StateTag::Broken);
}

#[tokio::test]
async fn keepalive_with_wrong_length_is_a_framing_error() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    let mut stream = conn
        .start_replication("s1", Lsn::INVALID, options(), &[])
        .await
        .unwrap();

    let mut short = vec![b'k'];
    short.extend_from_slice(&0x10u64.to_be_bytes());
    short.push(0);
    server.push(&[msg(b'd', &short)]).await;

    let err = stream.fetch_next().await.unwrap_err();
    assert!(matches!(err, PgWireError::Protocol(_)), "{err}");
    drop(stream);
    assert_eq!(conn.state(), StateTag::Broken);
}

#[tokio::test]
async fn keepalive_end_regression_is_rejected() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    let mut stream = conn
        .start_replication("s1", Lsn::INVALID, options(), &[])
        .await
        .unwrap();

    server
        .push(&[keepalive(0x200, 1, 0), keepalive(0x100, 2, 0)])
        .await;
    assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::KeepAlive);
    assert!(stream.fetch_next().await.unwrap_err().is_fatal());
    drop(stream);
    assert_eq!(conn.state(), StateTag::Broken);
}

#[tokio::test]
async fn unexpected_message_while_streaming_breaks_connection() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    let mut stream = conn
        .start_replication("s1", Lsn::INVALID, options(), &[])
        .await
        .unwrap();

    server.push(&[data_row(&[Some("1")])]).await;
    let err = stream.fetch_next().await.unwrap_err();
    assert!(matches!(err, PgWireError::Protocol(_)));
    drop(stream);
    assert_eq!(conn.state(), StateTag::Broken);
}

#[tokio::test]
async fn start_replication_error_keeps_connection_ready() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server
        .push(&[
            error_response("42704", "replication slot \"nope\" does not exist"),
            ready(b'I'),
        ])
        .await;

    let err = conn
        .start_replication("nope", Lsn::INVALID, options(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.sqlstate(), Some("42704"));
    assert_eq!(conn.state(), StateTag::Ready);

    server.push(&[copy_both()]).await;
    conn.start_replication("s1", Lsn::INVALID, options(), &[])
        .await
        .unwrap();
    assert_eq!(conn.state(), StateTag::ReplicationStreaming);
}

#[tokio::test]
async fn server_error_mid_stream_ends_session() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    let mut stream = conn
        .start_replication("s1", Lsn::INVALID, options(), &[])
        .await
        .unwrap();

    server
        .push(&[
            error_response("57P01", "terminating connection due to administrator command"),
            ready(b'I'),
        ])
        .await;
    let err = stream.fetch_next().await.unwrap_err();
    assert!(err.is_server());
    assert!(stream.end_of_stream());
    drop(stream);
    assert_eq!(conn.state(), StateTag::Ready);
}

#[tokio::test]
async fn sequential_sessions_on_one_connection() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;

    for (i, start) in [0x1000u64, 0x2000].into_iter().enumerate() {
        server
            .push(&[copy_both(), xlog_data(start, start + 0x10, 1, b"tx")])
            .await;
        let mut stream = conn
            .start_replication("s1", Lsn(start), options(), &[])
            .await
            .unwrap();
        assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::Data, "session {i}");
        assert_eq!(stream.start_lsn(), Lsn(start));

        server
            .push(&[copy_done(), command_complete("START_REPLICATION"), ready(b'I')])
            .await;
        // the unread body is skipped by close
        stream.close().await.unwrap();
        assert!(stream.end_of_stream());
        assert_eq!(stream.start_lsn(), Lsn(start));
        assert_eq!(conn.state(), StateTag::Ready);
    }

    conn.close().await;
    let tags: Vec<u8> = server.read_to_end().await.iter().map(|(t, _)| *t).collect();
    assert_eq!(tags, b"QcQcX");
}

#[tokio::test]
async fn data_reader_streams_the_body() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    let mut stream = conn
        .start_replication("s1", Lsn::INVALID, options(), &[])
        .await
        .unwrap();

    let body: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    server
        .push(&[xlog_data(0x10, 0x20, 1, &body), keepalive(0x30, 2, 0)])
        .await;

    assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::Data);
    let mut head = vec![0u8; 100];
    {
        let mut reader = stream.data_reader().unwrap();
        assert_eq!(reader.remaining(), 5000);
        reader.read_exact(&mut head).await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), 4900);
        assert_eq!(&rest[..], &body[100..]);
    }
    assert_eq!(&head[..], &body[..100]);
    assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::KeepAlive);
}

#[tokio::test]
async fn partial_frame_survives_empty_polls() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    let mut stream = conn
        .start_replication("s1", Lsn::INVALID, options(), &[])
        .await
        .unwrap();

    let frame = xlog_data(0x40, 0x40, 9, b"payload");
    server.io.write_all(&frame[..12]).await.unwrap();
    assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::None);
    assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::None);

    server.io.write_all(&frame[12..]).await.unwrap();
    assert_eq!(
        stream.fetch_next_timeout(TIMEOUT).await.unwrap(),
        FetchStatus::Data
    );
    assert_eq!(stream.last_data().unwrap().server_clock, 9);
    assert_eq!(stream.read_data().await.unwrap().as_ref(), b"payload");
}

#[tokio::test]
async fn query_while_streaming_is_an_invalid_state() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    conn.start_replication("s1", Lsn::INVALID, options(), &[])
        .await
        .unwrap();

    let err = conn.query("SELECT 1").await.unwrap_err();
    assert!(matches!(
        err,
        PgWireError::InvalidState {
            state: StateTag::ReplicationStreaming,
            ..
        }
    ));

    // the session is still there
    let mut stream = conn.replication_stream().unwrap();
    server.push(&[parameter_status("in_hot_standby", "off")]).await;
    assert_eq!(
        stream.fetch_next().await.unwrap(),
        FetchStatus::None
    );
    drop(stream);
    assert_eq!(conn.parameter("in_hot_standby"), Some("off"));
}

// ---- channel client ----

#[tokio::test]
async fn client_streams_until_stop_lsn_on_supplied_connection() {
    let (conn, mut server) = connect(ReplicationMode::Logical).await;
    server
        .push(&[
            copy_both(),
            xlog_data(0x10, 0x20, 5, b"tx"),
            copy_done(),
            command_complete("START_REPLICATION"),
            ready(b'I'),
        ])
        .await;

    let cfg = ReplicationConfig {
        stop_at_lsn: Some(Lsn(0x20)),
        ..ReplicationConfig::new(config(ReplicationMode::Logical), "s1")
    };
    let mut client = ReplicationClient::spawn_on(cfg, conn);

    assert_eq!(
        client.recv().await.unwrap(),
        ReplicationEvent::XLogData {
            wal_start: Lsn(0x10),
            wal_end: Lsn(0x20),
            server_time_micros: 5,
            data: bytes::Bytes::from_static(b"tx"),
        }
    );
    assert_eq!(
        client.recv().await.unwrap(),
        ReplicationEvent::StoppedAt {
            reached: Lsn(0x20)
        }
    );
    assert!(matches!(
        client.recv().await.unwrap_err(),
        PgWireError::Task(_)
    ));
    client.join().await.unwrap();

    let tags: Vec<u8> = server.read_to_end().await.iter().map(|(t, _)| *t).collect();
    assert_eq!(tags, b"QcX");
}

#[tokio::test]
async fn client_reports_start_failure() {
    let (conn, mut server) = connect(ReplicationMode::Logical).await;
    server
        .push(&[
            error_response("42704", "replication slot \"s1\" does not exist"),
            ready(b'I'),
        ])
        .await;

    let cfg = ReplicationConfig::new(config(ReplicationMode::Logical), "s1");
    let mut client = ReplicationClient::spawn_on(cfg, conn);
    let err = client.recv().await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("42704"));
    client.join().await.unwrap();
}

// ---- status update monotonicity ----

#[tokio::test]
async fn status_updates_never_report_lower_positions() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    let mut stream = conn
        .start_replication("s1", Lsn::INVALID, options(), &[])
        .await
        .unwrap();

    server.push(&[xlog_data(0x200, 0x200, 1, b"a")]).await;
    assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::Data);
    assert!(stream.flush(false).await.unwrap());

    // logical decoding may hand out a frame that starts earlier
    server.push(&[xlog_data(0x100, 0x100, 2, b"b")]).await;
    assert_eq!(stream.fetch_next().await.unwrap(), FetchStatus::Data);
    assert_eq!(stream.start_lsn(), Lsn(0x100));
    assert!(!stream.flush(false).await.unwrap());
    assert!(stream.flush(true).await.unwrap());

    drop(stream);
    conn.close().await;
    let updates: Vec<(Lsn, Lsn)> = server
        .read_to_end()
        .await
        .iter()
        .filter(|(t, _)| *t == b'd')
        .map(|(_, b)| (lsn_at(b, 1), lsn_at(b, 9)))
        .collect();
    assert_eq!(
        updates,
        vec![(Lsn(0x200), Lsn(0x200)), (Lsn(0x200), Lsn(0x200))]
    );
}

#[tokio::test]
async fn status_becomes_due_after_interval() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&[copy_both()]).await;
    let opts = ReplicationOptions {
        poll_timeout: Duration::ZERO,
        status_interval: Duration::from_millis(50),
    };
    let mut stream = conn
        .start_replication("s1", Lsn::new(0, 0x10), opts, &[])
        .await
        .unwrap();

    assert!(!stream.status_due());
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(stream.status_due());

    assert!(stream.flush(true).await.unwrap());
    assert!(!stream.status_due());
}

// ---- replication commands ----

fn slot_row(consistent_point: &str) -> Vec<Vec<u8>> {
    vec![
        row_description(&["slot_name", "consistent_point", "snapshot_name", "output_plugin"]),
        data_row(&[
            Some("slot_a"),
            Some(consistent_point),
            Some("00000003-00000002-1"),
            Some("pgoutput"),
        ]),
        command_complete("CREATE_REPLICATION_SLOT"),
        ready(b'I'),
    ]
}

#[tokio::test]
async fn create_replication_slot_parses_result_row() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&slot_row("0/1A2B3C8")).await;

    let slot = conn
        .create_replication_slot("slot_a", "pgoutput")
        .await
        .unwrap();
    assert_eq!(slot.slot_name, "slot_a");
    assert_eq!(slot.consistent_point, Lsn::new(0, 0x01A2_B3C8));
    assert_eq!(slot.snapshot_name.as_deref(), Some("00000003-00000002-1"));
    assert_eq!(slot.output_plugin.as_deref(), Some("pgoutput"));

    let (tag, body) = server.read_msg().await;
    assert_eq!(tag, b'Q');
    assert_eq!(body, b"CREATE_REPLICATION_SLOT \"slot_a\" LOGICAL \"pgoutput\"\0");
}

#[tokio::test]
async fn create_replication_slot_rejects_malformed_lsn() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server.push(&slot_row("not-an-lsn")).await;

    let err = conn
        .create_replication_slot("slot_a", "pgoutput")
        .await
        .unwrap_err();
    assert!(matches!(err, PgWireError::LsnFormat(_)), "{err}");
    assert!(!err.is_fatal());
    assert_eq!(conn.state(), StateTag::Ready);
}

#[tokio::test]
async fn identify_system_and_drop_slot() {
    let (mut conn, mut server) = connect(ReplicationMode::Logical).await;
    server
        .push(&[
            row_description(&["systemid", "timeline", "xlogpos", "dbname"]),
            data_row(&[
                Some("7300000000000000001"),
                Some("1"),
                Some("0/16B3748"),
                Some("appdb"),
            ]),
            command_complete("IDENTIFY_SYSTEM"),
            ready(b'I'),
            command_complete("DROP_REPLICATION_SLOT"),
            ready(b'I'),
        ])
        .await;

    let identity = conn.identify_system().await.unwrap();
    assert_eq!(identity.system_id, "7300000000000000001");
    assert_eq!(identity.timeline, 1);
    assert_eq!(identity.xlog_pos, Lsn::new(0, 0x016B_3748));
    assert_eq!(identity.dbname.as_deref(), Some("appdb"));

    conn.drop_replication_slot("slot_a").await.unwrap();
    assert_eq!(conn.state(), StateTag::Ready);

    server.read_msg().await;
    let (tag, body) = server.read_msg().await;
    assert_eq!(tag, b'Q');
    assert_eq!(body, b"DROP_REPLICATION_SLOT \"slot_a\"\0");
}

// ---- protocol negotiation ----

fn negotiate(minor: i32, unrecognized: &[&str]) -> Vec<u8> {
    let mut p = minor.to_be_bytes().to_vec();
    p.extend_from_slice(&(unrecognized.len() as i32).to_be_bytes());
    for opt in unrecognized {
        cstr(&mut p, opt);
    }
    msg(b'v', &p)
}

#[tokio::test]
async fn negotiate_protocol_version_before_ready() {
    let (client, server) = duplex(PIPE);
    let mut server = MockServer { io: server };
    server
        .push(&[auth(0, &[]), negotiate(0, &["_pq_.compression"]), ready(b'I')])
        .await;

    let conn = Connection::handshake(client, &config(ReplicationMode::None))
        .await
        .unwrap();
    assert_eq!(conn.state(), StateTag::Ready);
    assert_eq!(conn.protocol_version(), (3, 0));
}

#[tokio::test]
async fn negotiate_protocol_version_above_request_fails() {
    let (client, server) = duplex(PIPE);
    let mut server = MockServer { io: server };
    server
        .push(&[auth(0, &[]), negotiate(2, &[]), ready(b'I')])
        .await;

    let err = Connection::handshake(client, &config(ReplicationMode::None))
        .await
        .unwrap_err();
    assert!(matches!(err, PgWireError::Protocol(_)), "{err}");
}

// ---- frontend validation ----

#[tokio::test]
async fn unencodable_requests_are_rejected_before_sending() {
    let (mut conn, mut server) = connect(ReplicationMode::None).await;

    let err = conn.query("SELECT 1\0").await.unwrap_err();
    assert!(matches!(err, PgWireError::Protocol(_)), "{err}");
    assert_eq!(conn.state(), StateTag::Ready);

    assert!(conn.parse("bad\0name", "SELECT 1", &[]).is_err());
    let params: Vec<Option<&[u8]>> = vec![None; i16::MAX as usize + 1];
    assert!(conn.bind("", "", &params, &[], &[]).is_err());
    assert!(
        conn.start_replication("s\01", Lsn::INVALID, options(), &[])
            .await
            .is_err()
    );
    assert_eq!(conn.state(), StateTag::Ready);

    // nothing was queued, so Sync is the only message on the wire
    server.push(&[ready(b'I')]).await;
    assert!(conn.sync().await.unwrap().is_empty());
    conn.close().await;
    let tags: Vec<u8> = server.read_to_end().await.iter().map(|(t, _)| *t).collect();
    assert_eq!(tags, b"SX");
}

// ---- SASL ----

#[cfg(feature = "scram")]
mod scram {
    use super::*;

    use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
    use hmac::{Hmac, Mac};
    use sha2::{Digest, Sha256};

    const SALT: &[u8] = b"mock-salt";
    const ITERATIONS: u32 = 16;

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn salted_password(password: &str) -> Vec<u8> {
        let mut first = SALT.to_vec();
        first.extend_from_slice(&1u32.to_be_bytes());
        let mut u = hmac(password.as_bytes(), &first);
        let mut out = u.clone();
        for _ in 1..ITERATIONS {
            u = hmac(password.as_bytes(), &u);
            out.iter_mut().zip(&u).for_each(|(o, x)| *o ^= x);
        }
        out
    }

    /// Play the server side of SCRAM-SHA-256 for password "secret".
    async fn serve_scram(server: &mut MockServer, tamper_signature: bool) {
        server.read_startup().await;

        let (tag, body) = server.read_msg().await;
        assert_eq!(tag, b'p');
        let mech_end = body.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&body[..mech_end], b"SCRAM-SHA-256");
        let client_first = std::str::from_utf8(&body[mech_end + 5..]).unwrap();
        let client_first_bare = client_first.strip_prefix("n,,").unwrap();
        let client_nonce = client_first_bare.strip_prefix("n=,r=").unwrap();

        let server_first = format!(
            "r={client_nonce}mockserver,s={},i={ITERATIONS}",
            B64.encode(SALT)
        );
        server.push(&[auth(11, server_first.as_bytes())]).await;

        let (tag, body) = server.read_msg().await;
        assert_eq!(tag, b'p');
        let client_final = std::str::from_utf8(&body).unwrap();
        let (without_proof, proof) = client_final.split_once(",p=").unwrap();
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

        let salted = salted_password("secret");
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let signature = hmac(&stored_key, auth_message.as_bytes());
        let expected: Vec<u8> = client_key.iter().zip(&signature).map(|(k, s)| k ^ s).collect();
        assert_eq!(B64.decode(proof).unwrap(), expected);

        let mut server_signature = hmac(&hmac(&salted, b"Server Key"), auth_message.as_bytes());
        if tamper_signature {
            server_signature[0] ^= 0xFF;
        }
        let server_final = format!("v={}", B64.encode(server_signature));
        server
            .push(&[auth(12, server_final.as_bytes()), auth(0, &[]), ready(b'I')])
            .await;
    }

    fn sasl_offer() -> Vec<u8> {
        let mut p = Vec::new();
        cstr(&mut p, "SCRAM-SHA-256-PLUS");
        cstr(&mut p, "SCRAM-SHA-256");
        p.push(0);
        auth(10, &p)
    }

    #[tokio::test]
    async fn scram_exchange_authenticates() {
        let (client, server) = duplex(PIPE);
        let mut server = MockServer { io: server };
        server.push(&[sasl_offer()]).await;

        let cfg = config(ReplicationMode::None);
        let (conn, ()) = tokio::join!(
            Connection::handshake(client, &cfg),
            serve_scram(&mut server, false)
        );
        assert_eq!(conn.unwrap().state(), StateTag::Ready);
    }

    #[tokio::test]
    async fn scram_rejects_wrong_server_signature() {
        let (client, server) = duplex(PIPE);
        let mut server = MockServer { io: server };
        server.push(&[sasl_offer()]).await;

        let cfg = config(ReplicationMode::None);
        let (conn, ()) = tokio::join!(
            Connection::handshake(client, &cfg),
            serve_scram(&mut server, true)
        );
        assert!(conn.unwrap_err().is_auth());
    }

    #[tokio::test]
    async fn sasl_without_supported_mechanism_fails() {
        let (client, server) = duplex(PIPE);
        let mut server = MockServer { io: server };
        let mut p = Vec::new();
        cstr(&mut p, "OAUTHBEARER");
        p.push(0);
        server.push(&[auth(10, &p)]).await;

        let err = Connection::handshake(client, &config(ReplicationMode::None))
            .await
            .unwrap_err();
        assert!(err.is_auth(), "{err}");
    }
}
