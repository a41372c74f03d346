use std::time::Duration;

use crate::lsn::Lsn;

/// Value of the `replication` startup parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationMode {
    /// Regular SQL session.
    #[default]
    None,
    /// `replication=true`: physical replication commands only.
    Physical,
    /// `replication=database`: logical replication commands plus SQL.
    Logical,
}

impl ReplicationMode {
    pub fn startup_value(self) -> Option<&'static str> {
        match self {
            ReplicationMode::None => None,
            ReplicationMode::Physical => Some("true"),
            ReplicationMode::Logical => Some("database"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,

    pub user: String,
    pub password: String,
    pub database: String,

    pub replication: ReplicationMode,
    pub application_name: String,

    /// Bound on TCP connect plus startup handshake.
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(host: &str, user: &str, password: &str, database: &str) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            password: password.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn with_replication(mut self, mode: ReplicationMode) -> Self {
        self.replication = mode;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "postgres".into(),
            password: "postgres".into(),
            database: "postgres".into(),
            replication: ReplicationMode::None,
            application_name: "pgwire-engine".into(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Knobs of a replication stream.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationOptions {
    /// How long `fetch_next` waits for a frame before reporting `None`.
    /// Zero polls without waiting.
    pub poll_timeout: Duration,

    /// Interval after which `status_due` asks for a status update. Must stay
    /// below the server's `wal_sender_timeout`.
    pub status_interval: Duration,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::ZERO,
            status_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration of a [`ReplicationClient`](crate::client::ReplicationClient).
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub connection: ConnectionConfig,

    pub slot: String,
    /// Output plugin options passed to START_REPLICATION, e.g.
    /// `("proto_version", "1")`, `("publication_names", "pub")` for pgoutput.
    pub plugin_options: Vec<(String, String)>,

    pub start_lsn: Lsn,

    /// Optional bound: stop once the WAL end reported by the server
    /// reaches `stop_at_lsn`.
    pub stop_at_lsn: Option<Lsn>,

    /// How often to send standby status updates (feedback).
    pub status_interval: Duration,

    /// If no server messages arrive within this interval, treat it as an error.
    pub idle_timeout: Duration,

    /// Bounded buffer size (#events) between replication worker and consumer.
    pub buffer_events: usize,
}

impl ReplicationConfig {
    pub fn new(connection: ConnectionConfig, slot: &str) -> Self {
        Self {
            connection: connection.with_replication(ReplicationMode::Logical),
            slot: slot.into(),
            ..Self::default()
        }
    }

    pub fn with_plugin_option(mut self, key: &str, value: &str) -> Self {
        self.plugin_options.push((key.into(), value.into()));
        self
    }

    pub(crate) fn stream_options(&self) -> ReplicationOptions {
        ReplicationOptions {
            // wait a little per poll so an idle stream does not spin
            poll_timeout: Duration::from_millis(100).min(self.idle_timeout),
            status_interval: self.status_interval,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default().with_replication(ReplicationMode::Logical),
            slot: "slot".into(),
            plugin_options: Vec::new(),
            start_lsn: Lsn::INVALID,
            stop_at_lsn: None,

            status_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            buffer_events: 8192,
        }
    }
}
