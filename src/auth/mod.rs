//! Password authentication for the startup handshake.
//!
//! - cleartext password: always available;
//! - MD5 (feature `md5`): `"md5" + md5(md5(password + user) + salt)`;
//! - SCRAM-SHA-256 (feature `scram`, default): see [`scram`].
//!
//! Kerberos, GSSAPI and SSPI requests are rejected with an auth error.

#[cfg(feature = "scram")]
pub mod scram;

#[cfg(feature = "scram")]
pub use scram::ScramSha256;

#[cfg(feature = "md5")]
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(&salt);
    format!("md5{:x}", md5::compute(outer))
}
