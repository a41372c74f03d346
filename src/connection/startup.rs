use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::{Connection, ConnectionState};
use crate::config::ConnectionConfig;
use crate::error::{PgWireError, Result};
use crate::protocol::backend::{Authentication, BackendMessage};
use crate::protocol::framing::{PROTOCOL_VERSION_3, check_cstr, write_startup};
use crate::protocol::frontend::FrontendMessage;

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Run the startup handshake over an already open stream.
    ///
    /// Returns a `Ready` connection once the server sends ReadyForQuery.
    pub async fn handshake(io: S, config: &ConnectionConfig) -> Result<Self> {
        let mut conn = Connection::new(io);
        let res = conn.startup(config).await;
        conn.check(res)?;
        Ok(conn)
    }

    async fn startup(&mut self, config: &ConnectionConfig) -> Result<()> {
        let mut params = vec![
            ("user", config.user.as_str()),
            ("database", config.database.as_str()),
            ("client_encoding", "UTF8"),
            ("application_name", config.application_name.as_str()),
        ];
        if let Some(mode) = config.replication.startup_value() {
            params.push(("replication", mode));
        }

        for (name, value) in &params {
            check_cstr(name, value)?;
        }

        let stream = self.io()?;
        write_startup(stream.write_buf_mut(), PROTOCOL_VERSION_3, &params);
        stream.flush().await?;
        debug!(user = %config.user, database = %config.database, "startup sent");

        loop {
            match self.recv().await? {
                BackendMessage::Authentication(auth) => self.authenticate(auth, config).await?,
                BackendMessage::BackendKeyData(key) => self.backend_key = Some(key),
                BackendMessage::NegotiateProtocolVersion(n) => {
                    // the server may only lower the minor version we asked for
                    if !(0..=self.protocol_minor).contains(&n.newest_minor) {
                        return Err(PgWireError::protocol(format!(
                            "server negotiated protocol 3.{}, requested 3.{}",
                            n.newest_minor, self.protocol_minor
                        )));
                    }
                    debug!(
                        minor = n.newest_minor,
                        unrecognized = ?n.unrecognized,
                        "server negotiated protocol version"
                    );
                    self.protocol_minor = n.newest_minor;
                }
                BackendMessage::ErrorResponse(fields) => return Err(PgWireError::Server(fields)),
                BackendMessage::ReadyForQuery(status) => {
                    self.transaction_status = status;
                    self.transition(ConnectionState::Ready);
                    info!(
                        server_version = self.parameter("server_version").unwrap_or("?"),
                        "connection ready"
                    );
                    return Ok(());
                }
                other => {
                    return Err(PgWireError::protocol(format!(
                        "unexpected {} during startup",
                        other.name()
                    )));
                }
            }
        }
    }

    async fn authenticate(&mut self, auth: Authentication, config: &ConnectionConfig) -> Result<()> {
        match auth {
            Authentication::Ok => {
                debug!("authenticated");
                Ok(())
            }
            Authentication::CleartextPassword => {
                let msg = FrontendMessage::Password(&config.password);
                msg.validate()?;
                let stream = self.io()?;
                stream.send(msg);
                stream.flush().await
            }
            #[cfg(feature = "md5")]
            Authentication::Md5Password { salt } => {
                let hashed = crate::auth::md5_password(&config.user, &config.password, salt);
                let stream = self.io()?;
                stream.send(FrontendMessage::Password(&hashed));
                stream.flush().await
            }
            #[cfg(not(feature = "md5"))]
            Authentication::Md5Password { .. } => Err(PgWireError::Auth(
                "server requested MD5 password but the md5 feature is disabled".into(),
            )),
            Authentication::Sasl { mechanisms } => self.auth_sasl(&mechanisms, config).await,
            Authentication::SaslContinue { .. } | Authentication::SaslFinal { .. } => Err(
                PgWireError::Auth("SASL message outside of a SASL exchange".into()),
            ),
            Authentication::Unsupported(code) => Err(PgWireError::Auth(format!(
                "unsupported auth method: {code}"
            ))),
        }
    }

    #[cfg(not(feature = "scram"))]
    async fn auth_sasl(&mut self, mechanisms: &[String], _config: &ConnectionConfig) -> Result<()> {
        Err(PgWireError::Auth(format!(
            "server requested SASL ({mechanisms:?}) but the scram feature is disabled"
        )))
    }

    #[cfg(feature = "scram")]
    async fn auth_sasl(&mut self, mechanisms: &[String], config: &ConnectionConfig) -> Result<()> {
        use crate::auth::scram::{MECHANISM, ScramSha256};

        if !mechanisms.iter().any(|m| m == MECHANISM) {
            return Err(PgWireError::Auth(format!(
                "server does not offer {MECHANISM}: {mechanisms:?}"
            )));
        }

        let mut scram = ScramSha256::new(&config.password);
        let stream = self.io()?;
        stream.send(FrontendMessage::SaslInitialResponse {
            mechanism: MECHANISM,
            data: &scram.client_first(),
        });
        stream.flush().await?;

        let server_first = match self.recv_auth().await? {
            Authentication::SaslContinue { data } => data,
            other => {
                return Err(PgWireError::Auth(format!(
                    "expected SASL continue, got {other:?}"
                )));
            }
        };
        let client_final = scram.update(&server_first)?;
        let stream = self.io()?;
        stream.send(FrontendMessage::SaslResponse(&client_final));
        stream.flush().await?;

        match self.recv_auth().await? {
            Authentication::SaslFinal { data } => scram.finish(&data),
            other => Err(PgWireError::Auth(format!(
                "expected SASL final, got {other:?}"
            ))),
        }
    }

    #[cfg(feature = "scram")]
    async fn recv_auth(&mut self) -> Result<Authentication> {
        match self.recv().await? {
            BackendMessage::Authentication(auth) => Ok(auth),
            BackendMessage::ErrorResponse(fields) => Err(PgWireError::Server(fields)),
            other => Err(PgWireError::protocol(format!(
                "unexpected {} during authentication",
                other.name()
            ))),
        }
    }
}
