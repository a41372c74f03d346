//! Backend (server to client) messages.
//!
//! Each message kind is one variant of [`BackendMessage`], decoded by a single
//! dispatch on the tag byte. Decoders read through a [`PayloadReader`], so a
//! payload that is shorter or longer than its layout is a framing error.

use bytes::Bytes;

use super::framing::{Frame, PayloadReader};
use super::frontend::Oid;
use super::messages::ErrorFields;
use crate::error::{PgWireError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    /// SASL mechanisms in the server's order of preference.
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
    /// Kerberos, GSSAPI, SSPI: recognised but not supported.
    Unsupported(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    pub process_id: i32,
    pub secret_key: i32,
}

/// Transaction status carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: Oid,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl RowDescription {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    /// Column values, `None` for SQL NULL.
    pub columns: Vec<Option<Bytes>>,
}

impl DataRow {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Text-format value of column `idx`. `Ok(None)` for NULL.
    pub fn get_text(&self, idx: usize) -> Result<Option<&str>> {
        let col = self.columns.get(idx).ok_or_else(|| {
            PgWireError::protocol(format!(
                "column index {idx} out of range ({} columns)",
                self.columns.len()
            ))
        })?;
        col.as_deref()
            .map(|v| {
                std::str::from_utf8(v).map_err(|e| {
                    PgWireError::protocol(format!("column {idx} is not valid UTF-8: {e}"))
                })
            })
            .transpose()
    }
}

/// Body of CopyIn/CopyOut/CopyBothResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResponse {
    /// 0 text, 1 binary.
    pub format: u8,
    pub column_formats: Vec<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateProtocolVersion {
    pub newest_minor: i32,
    pub unrecognized: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    ParameterStatus { name: String, value: String },
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    ReadyForQuery(TransactionStatus),
    RowDescription(RowDescription),
    DataRow(DataRow),
    CommandComplete { tag: String },
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    ParameterDescription(Vec<Oid>),
    PortalSuspended,
    CopyInResponse(CopyResponse),
    CopyOutResponse(CopyResponse),
    CopyBothResponse(CopyResponse),
    CopyData(Bytes),
    CopyDone,
    NotificationResponse(Notification),
}

impl BackendMessage {
    /// Decode a frame's payload according to its tag.
    pub fn decode(tag: u8, payload: Bytes) -> Result<BackendMessage> {
        let name = Self::message_name(tag);
        let mut r = PayloadReader::new(name, payload);
        let msg = match tag {
            b'R' => BackendMessage::Authentication(decode_auth(&mut r)?),
            b'K' => BackendMessage::BackendKeyData(BackendKeyData {
                process_id: r.i32()?,
                secret_key: r.i32()?,
            }),
            b'S' => BackendMessage::ParameterStatus {
                name: r.cstr()?,
                value: r.cstr()?,
            },
            b'v' => BackendMessage::NegotiateProtocolVersion(decode_negotiate(&mut r)?),
            b'Z' => BackendMessage::ReadyForQuery(decode_ready(&mut r)?),
            b'T' => BackendMessage::RowDescription(decode_row_description(&mut r)?),
            b'D' => BackendMessage::DataRow(decode_data_row(&mut r)?),
            b'C' => BackendMessage::CommandComplete { tag: r.cstr()? },
            b'I' => BackendMessage::EmptyQueryResponse,
            b'E' => BackendMessage::ErrorResponse(ErrorFields::parse(&r.rest())),
            b'N' => BackendMessage::NoticeResponse(ErrorFields::parse(&r.rest())),
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'n' => BackendMessage::NoData,
            b't' => {
                let n = r.i16()?;
                let mut oids = Vec::with_capacity(n.max(0) as usize);
                for _ in 0..n {
                    oids.push(r.u32()?);
                }
                BackendMessage::ParameterDescription(oids)
            }
            b's' => BackendMessage::PortalSuspended,
            b'G' => BackendMessage::CopyInResponse(decode_copy_response(&mut r)?),
            b'H' => BackendMessage::CopyOutResponse(decode_copy_response(&mut r)?),
            b'W' => BackendMessage::CopyBothResponse(decode_copy_response(&mut r)?),
            b'd' => BackendMessage::CopyData(r.rest()),
            b'c' => BackendMessage::CopyDone,
            b'A' => BackendMessage::NotificationResponse(Notification {
                process_id: r.i32()?,
                channel: r.cstr()?,
                payload: r.cstr()?,
            }),
            _ => {
                return Err(PgWireError::protocol(format!(
                    "unknown backend message tag: 0x{tag:02x} ('{}')",
                    tag as char
                )));
            }
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn from_frame(frame: Frame) -> Result<BackendMessage> {
        Self::decode(frame.tag, frame.payload)
    }

    /// Get message name from message type.
    ///
    /// Returns `"Unknown"` for unknown message type.
    pub fn message_name(tag: u8) -> &'static str {
        match tag {
            b'R' => "Authentication",
            b'K' => "BackendKeyData",
            b'S' => "ParameterStatus",
            b'v' => "NegotiateProtocolVersion",
            b'Z' => "ReadyForQuery",
            b'T' => "RowDescription",
            b'D' => "DataRow",
            b'C' => "CommandComplete",
            b'I' => "EmptyQueryResponse",
            b'E' => "ErrorResponse",
            b'N' => "NoticeResponse",
            b'1' => "ParseComplete",
            b'2' => "BindComplete",
            b'3' => "CloseComplete",
            b'n' => "NoData",
            b't' => "ParameterDescription",
            b's' => "PortalSuspended",
            b'G' => "CopyInResponse",
            b'H' => "CopyOutResponse",
            b'W' => "CopyBothResponse",
            b'd' => "CopyData",
            b'c' => "CopyDone",
            b'A' => "NotificationResponse",
            _ => "Unknown",
        }
    }

    /// Short name of this message, for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::Authentication(_) => "Authentication",
            BackendMessage::BackendKeyData(_) => "BackendKeyData",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::NegotiateProtocolVersion(_) => "NegotiateProtocolVersion",
            BackendMessage::ReadyForQuery(_) => "ReadyForQuery",
            BackendMessage::RowDescription(_) => "RowDescription",
            BackendMessage::DataRow(_) => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ErrorResponse(_) => "ErrorResponse",
            BackendMessage::NoticeResponse(_) => "NoticeResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::ParameterDescription(_) => "ParameterDescription",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::CopyInResponse(_) => "CopyInResponse",
            BackendMessage::CopyOutResponse(_) => "CopyOutResponse",
            BackendMessage::CopyBothResponse(_) => "CopyBothResponse",
            BackendMessage::CopyData(_) => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
            BackendMessage::NotificationResponse(_) => "NotificationResponse",
        }
    }
}

fn decode_auth(r: &mut PayloadReader) -> Result<Authentication> {
    let auth = match r.i32()? {
        0 => Authentication::Ok,
        3 => Authentication::CleartextPassword,
        5 => {
            let salt = r.bytes(4)?;
            Authentication::Md5Password {
                salt: [salt[0], salt[1], salt[2], salt[3]],
            }
        }
        10 => {
            let mut mechanisms = Vec::new();
            loop {
                let m = r.cstr()?;
                if m.is_empty() {
                    break;
                }
                mechanisms.push(m);
            }
            Authentication::Sasl { mechanisms }
        }
        11 => Authentication::SaslContinue { data: r.rest() },
        12 => Authentication::SaslFinal { data: r.rest() },
        code @ (2 | 7 | 8 | 9) => {
            // GSS continuation data is opaque to us
            r.rest();
            Authentication::Unsupported(code)
        }
        code => {
            return Err(PgWireError::protocol(format!(
                "unknown authentication request code {code}"
            )));
        }
    };
    Ok(auth)
}

fn decode_negotiate(r: &mut PayloadReader) -> Result<NegotiateProtocolVersion> {
    let newest_minor = r.i32()?;
    let n = r.i32()?;
    let mut unrecognized = Vec::with_capacity(n.clamp(0, 64) as usize);
    for _ in 0..n {
        unrecognized.push(r.cstr()?);
    }
    Ok(NegotiateProtocolVersion {
        newest_minor,
        unrecognized,
    })
}

fn decode_ready(r: &mut PayloadReader) -> Result<TransactionStatus> {
    match r.u8()? {
        b'I' => Ok(TransactionStatus::Idle),
        b'T' => Ok(TransactionStatus::InTransaction),
        b'E' => Ok(TransactionStatus::Failed),
        other => Err(PgWireError::protocol(format!(
            "invalid transaction status in ReadyForQuery: 0x{other:02x}"
        ))),
    }
}

fn decode_row_description(r: &mut PayloadReader) -> Result<RowDescription> {
    let n = r.i16()?;
    let mut fields = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
        fields.push(FieldDescription {
            name: r.cstr()?,
            table_oid: r.u32()?,
            column_attr: r.i16()?,
            type_oid: r.u32()?,
            type_size: r.i16()?,
            type_modifier: r.i32()?,
            format: r.i16()?,
        });
    }
    Ok(RowDescription { fields })
}

fn decode_data_row(r: &mut PayloadReader) -> Result<DataRow> {
    let n = r.i16()?;
    let mut columns = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
        let len = r.i32()?;
        if len < 0 {
            columns.push(None);
        } else {
            columns.push(Some(r.bytes(len as usize)?));
        }
    }
    Ok(DataRow { columns })
}

fn decode_copy_response(r: &mut PayloadReader) -> Result<CopyResponse> {
    let format = r.u8()?;
    let n = r.i16()?;
    let mut column_formats = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
        column_formats.push(r.i16()?);
    }
    Ok(CopyResponse {
        format,
        column_formats,
    })
}
