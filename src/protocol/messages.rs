use std::fmt;

/// Fields of an ErrorResponse or NoticeResponse body.
///
/// The body is a sequence of `(code_byte, cstring)` pairs terminated by a
/// zero byte. Unknown field codes are ignored, as the protocol requires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// `S` / `V`: ERROR, FATAL, PANIC, WARNING, NOTICE, ...
    pub severity: Option<String>,
    /// `C`: SQLSTATE code.
    pub code: Option<String>,
    /// `M`: primary message.
    pub message: Option<String>,
    /// `D`: detail.
    pub detail: Option<String>,
    /// `H`: hint.
    pub hint: Option<String>,
    /// `P`: cursor position into the query string.
    pub position: Option<String>,
    /// `W`: context.
    pub context: Option<String>,
    /// `F`, `L`, `R`: source location in the server.
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
}

impl ErrorFields {
    pub fn parse(payload: &[u8]) -> ErrorFields {
        let mut fields = ErrorFields::default();
        let mut b = payload;

        while let Some((&code, rest)) = b.split_first() {
            if code == 0 {
                break;
            }
            let Some(pos) = rest.iter().position(|&x| x == 0) else {
                break;
            };
            let value = String::from_utf8_lossy(&rest[..pos]).into_owned();
            b = &rest[pos + 1..];

            let slot = match code {
                // `V` is the non-localized severity, prefer it over `S`
                b'S' if fields.severity.is_some() => continue,
                b'S' | b'V' => &mut fields.severity,
                b'C' => &mut fields.code,
                b'M' => &mut fields.message,
                b'D' => &mut fields.detail,
                b'H' => &mut fields.hint,
                b'P' => &mut fields.position,
                b'W' => &mut fields.context,
                b'F' => &mut fields.file,
                b'L' => &mut fields.line,
                b'R' => &mut fields.routine,
                _ => continue,
            };
            *slot = Some(value);
        }

        fields
    }

    /// `true` when the server reported a FATAL or PANIC severity, after which
    /// it closes the session.
    pub fn is_fatal_severity(&self) -> bool {
        matches!(self.severity.as_deref(), Some("FATAL" | "PANIC"))
    }
}

impl fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = self.message.as_deref().unwrap_or("unknown server error");
        if let Some(sev) = &self.severity {
            write!(f, "{sev}: ")?;
        }
        f.write_str(msg)?;
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {code})")?;
        }
        Ok(())
    }
}

/// Render an ErrorResponse body as a single line.
pub fn parse_error_response(payload: &[u8]) -> String {
    ErrorFields::parse(payload).to_string()
}
