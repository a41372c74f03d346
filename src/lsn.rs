use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLsnError(pub String);

impl fmt::Display for ParseLsnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid LSN: {:?}", self.0)
    }
}
impl std::error::Error for ParseLsnError {}

/// Position in the write-ahead log.
///
/// Postgres renders an LSN as two 32-bit halves, `upper/lower`. Ordering is by
/// the composite 64-bit value. `0/0` is valid but means "unset".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The unset position, `0/0`.
    pub const INVALID: Lsn = Lsn(0);

    #[inline]
    pub const fn new(upper: u32, lower: u32) -> Lsn {
        Lsn(((upper as u64) << 32) | lower as u64)
    }

    #[inline]
    pub const fn upper(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn lower(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Parse the textual `XXXXXXXX/XXXXXXXX` form. Hex digits are accepted in
    /// either case, each half must have 1 to 8 of them.
    pub fn parse(s: &str) -> Result<Lsn, ParseLsnError> {
        let err = || ParseLsnError(s.into());
        let (hi, lo) = s.split_once('/').ok_or_else(err)?;
        let upper = parse_half(hi).ok_or_else(err)?;
        let lower = parse_half(lo).ok_or_else(err)?;
        Ok(Lsn::new(upper, lower))
    }

    pub fn to_pg_string(self) -> String {
        format!("{:08X}/{:08X}", self.upper(), self.lower())
    }
}

// `from_str_radix` tolerates a leading sign, so the digits are checked first.
fn parse_half(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lsn::parse(s)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}/{:08X}", self.upper(), self.lower())
    }
}
