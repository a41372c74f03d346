//! Frontend (client to server) messages.
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use bytes::{BufMut, BytesMut};

use super::framing::{HEADER_LEN, MAX_MESSAGE_LEN, check_cstr, put_cstr};
use crate::error::{PgWireError, Result};

/// Postgres object id of a data type.
pub type Oid = u32;

/// Wire format of a parameter or result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Binary,
}

impl Format {
    pub fn code(self) -> i16 {
        match self {
            Format::Text => 0,
            Format::Binary => 1,
        }
    }
}

/// What a Describe or Close message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    pub fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FrontendMessage<'a> {
    /// Simple query.
    Query { sql: &'a str },
    /// Prepare `sql` as statement `name` (empty selects the unnamed statement).
    Parse {
        name: &'a str,
        sql: &'a str,
        param_types: &'a [Oid],
    },
    /// Bind a prepared statement to a portal. `None` params are NULL.
    Bind {
        portal: &'a str,
        statement: &'a str,
        param_formats: &'a [Format],
        params: &'a [Option<&'a [u8]>],
        result_formats: &'a [Format],
    },
    Describe { target: Target, name: &'a str },
    /// Run a portal. `max_rows` zero means no limit.
    Execute { portal: &'a str, max_rows: u32 },
    Close { target: Target, name: &'a str },
    Sync,
    Flush,
    Terminate,
    CopyData(&'a [u8]),
    CopyDone,
    /// Password (cleartext or md5), written as a cstring.
    Password(&'a str),
    SaslInitialResponse { mechanism: &'a str, data: &'a [u8] },
    SaslResponse(&'a [u8]),
}

impl FrontendMessage<'_> {
    pub fn tag(&self) -> u8 {
        match self {
            FrontendMessage::Query { .. } => b'Q',
            FrontendMessage::Parse { .. } => b'P',
            FrontendMessage::Bind { .. } => b'B',
            FrontendMessage::Describe { .. } => b'D',
            FrontendMessage::Execute { .. } => b'E',
            FrontendMessage::Close { .. } => b'C',
            FrontendMessage::Sync => b'S',
            FrontendMessage::Flush => b'H',
            FrontendMessage::Terminate => b'X',
            FrontendMessage::CopyData(_) => b'd',
            FrontendMessage::CopyDone => b'c',
            FrontendMessage::Password(_)
            | FrontendMessage::SaslInitialResponse { .. }
            | FrontendMessage::SaslResponse(_) => b'p',
        }
    }

    /// Check that the message can be encoded: strings without NUL bytes,
    /// array counts that fit the `i16` count fields, and a total length
    /// below [`MAX_MESSAGE_LEN`]. [`encode`](Self::encode) assumes this holds.
    pub fn validate(&self) -> Result<()> {
        match *self {
            FrontendMessage::Query { sql } => check_cstr("query", sql)?,
            FrontendMessage::Parse {
                name,
                sql,
                param_types,
            } => {
                check_cstr("statement name", name)?;
                check_cstr("query", sql)?;
                check_count("parameter types", param_types.len())?;
            }
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => {
                check_cstr("portal name", portal)?;
                check_cstr("statement name", statement)?;
                check_count("parameter formats", param_formats.len())?;
                check_count("parameters", params.len())?;
                check_count("result formats", result_formats.len())?;
            }
            FrontendMessage::Describe { name, .. } | FrontendMessage::Close { name, .. } => {
                check_cstr("name", name)?
            }
            FrontendMessage::Execute { portal, .. } => check_cstr("portal name", portal)?,
            FrontendMessage::Password(password) => check_cstr("password", password)?,
            FrontendMessage::SaslInitialResponse { mechanism, .. } => {
                check_cstr("SASL mechanism", mechanism)?
            }
            FrontendMessage::Sync
            | FrontendMessage::Flush
            | FrontendMessage::Terminate
            | FrontendMessage::CopyData(_)
            | FrontendMessage::CopyDone
            | FrontendMessage::SaslResponse(_) => {}
        }

        let len = self.body_len();
        if len > MAX_MESSAGE_LEN - HEADER_LEN {
            return Err(PgWireError::protocol(format!(
                "{} message of {len} bytes exceeds the protocol limit",
                self.tag() as char
            )));
        }
        Ok(())
    }

    /// Encoded size after the tag and length.
    fn body_len(&self) -> usize {
        let cstr = |s: &str| s.len() + 1;
        match *self {
            FrontendMessage::Query { sql } => cstr(sql),
            FrontendMessage::Parse {
                name,
                sql,
                param_types,
            } => cstr(name) + cstr(sql) + 2 + 4 * param_types.len(),
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => {
                let values: usize = params
                    .iter()
                    .map(|p| 4 + p.map_or(0, <[u8]>::len))
                    .sum();
                cstr(portal)
                    + cstr(statement)
                    + 2
                    + 2 * param_formats.len()
                    + 2
                    + values
                    + 2
                    + 2 * result_formats.len()
            }
            FrontendMessage::Describe { name, .. } | FrontendMessage::Close { name, .. } => {
                1 + cstr(name)
            }
            FrontendMessage::Execute { portal, .. } => cstr(portal) + 4,
            FrontendMessage::Sync
            | FrontendMessage::Flush
            | FrontendMessage::Terminate
            | FrontendMessage::CopyDone => 0,
            FrontendMessage::CopyData(data) | FrontendMessage::SaslResponse(data) => data.len(),
            FrontendMessage::Password(password) => cstr(password),
            FrontendMessage::SaslInitialResponse { mechanism, data } => {
                cstr(mechanism) + 4 + data.len()
            }
        }
    }

    /// Append the message to `buf`: tag, length (counting itself), body.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag());
        let len_at = buf.len();
        buf.put_i32(0);

        match *self {
            FrontendMessage::Query { sql } => put_cstr(buf, sql),
            FrontendMessage::Parse {
                name,
                sql,
                param_types,
            } => {
                put_cstr(buf, name);
                put_cstr(buf, sql);
                buf.put_i16(param_types.len() as i16);
                for oid in param_types {
                    buf.put_u32(*oid);
                }
            }
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => {
                put_cstr(buf, portal);
                put_cstr(buf, statement);
                buf.put_i16(param_formats.len() as i16);
                for f in param_formats {
                    buf.put_i16(f.code());
                }
                buf.put_i16(params.len() as i16);
                for p in params {
                    match p {
                        // -1 marks NULL, no value bytes follow
                        None => buf.put_i32(-1),
                        Some(v) => {
                            buf.put_i32(v.len() as i32);
                            buf.extend_from_slice(v);
                        }
                    }
                }
                buf.put_i16(result_formats.len() as i16);
                for f in result_formats {
                    buf.put_i16(f.code());
                }
            }
            FrontendMessage::Describe { target, name } | FrontendMessage::Close { target, name } => {
                buf.put_u8(target.code());
                put_cstr(buf, name);
            }
            FrontendMessage::Execute { portal, max_rows } => {
                put_cstr(buf, portal);
                buf.put_u32(max_rows);
            }
            FrontendMessage::Sync
            | FrontendMessage::Flush
            | FrontendMessage::Terminate
            | FrontendMessage::CopyDone => {}
            FrontendMessage::CopyData(data) | FrontendMessage::SaslResponse(data) => {
                buf.extend_from_slice(data)
            }
            FrontendMessage::Password(password) => put_cstr(buf, password),
            FrontendMessage::SaslInitialResponse { mechanism, data } => {
                put_cstr(buf, mechanism);
                buf.put_i32(data.len() as i32);
                buf.extend_from_slice(data);
            }
        }

        let len = (buf.len() - len_at) as i32;
        buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
    }
}

fn check_count(what: &str, n: usize) -> Result<()> {
    if n > i16::MAX as usize {
        return Err(PgWireError::protocol(format!(
            "{n} {what} exceed the limit of {}",
            i16::MAX
        )));
    }
    Ok(())
}
