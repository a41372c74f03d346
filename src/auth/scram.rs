//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677) without channel binding.
//!
//! The exchange is driven by the startup handshake:
//!
//! ```ignore
//! let mut scram = ScramSha256::new(password);
//! send(SaslInitialResponse { mechanism: "SCRAM-SHA-256", data: scram.client_first() });
//! let client_final = scram.update(&server_first)?;   // AuthenticationSASLContinue
//! send(SaslResponse(client_final));
//! scram.finish(&server_final)?;                      // AuthenticationSASLFinal
//! ```

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{PgWireError, Result};

pub const MECHANISM: &str = "SCRAM-SHA-256";

/// base64("n,,"): no channel binding.
const GS2_HEADER_B64: &str = "biws";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug)]
enum Step {
    Start,
    SentFinal {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

#[derive(Debug)]
pub struct ScramSha256 {
    password: String,
    nonce: String,
    step: Step,
}

impl ScramSha256 {
    pub fn new(password: &str) -> Self {
        let mut raw = [0u8; 18];
        rand::rng().fill_bytes(&mut raw);
        Self::with_nonce(password, &B64.encode(raw))
    }

    pub(crate) fn with_nonce(password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            nonce: nonce.to_string(),
            step: Step::Start,
        }
    }

    // The user name is taken from the startup packet, so it is left empty here.
    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.nonce)
    }

    /// Body of the SASLInitialResponse.
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume the server-first-message and return the client-final-message.
    pub fn update(&mut self, server_first: &[u8]) -> Result<Vec<u8>> {
        if !matches!(self.step, Step::Start) {
            return Err(PgWireError::Auth("unexpected SCRAM server-first".into()));
        }
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| PgWireError::Auth("SCRAM server-first is not UTF-8".into()))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => salt = Some(v),
                Some(("i", v)) => iterations = v.parse::<u32>().ok(),
                _ => {}
            }
        }
        let nonce = nonce.ok_or_else(|| PgWireError::Auth("SCRAM server-first missing r=".into()))?;
        let salt = salt.ok_or_else(|| PgWireError::Auth("SCRAM server-first missing s=".into()))?;
        let iterations = iterations
            .filter(|&i| i > 0)
            .ok_or_else(|| PgWireError::Auth("SCRAM server-first has no valid i=".into()))?;

        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(PgWireError::Auth("SCRAM server nonce does not extend ours".into()));
        }
        let salt = B64
            .decode(salt)
            .map_err(|e| PgWireError::Auth(format!("SCRAM salt is not base64: {e}")))?;

        let salted_password = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={GS2_HEADER_B64},r={nonce}");
        let auth_message = format!("{},{server_first},{without_proof}", self.client_first_bare());
        let signature = hmac(&stored_key, auth_message.as_bytes());

        let mut proof = client_key;
        proof.iter_mut().zip(signature).for_each(|(p, s)| *p ^= s);

        self.step = Step::SentFinal {
            salted_password,
            auth_message,
        };
        Ok(format!("{without_proof},p={}", B64.encode(proof)).into_bytes())
    }

    /// Verify the server-final-message (mutual authentication).
    pub fn finish(&mut self, server_final: &[u8]) -> Result<()> {
        let Step::SentFinal {
            salted_password,
            auth_message,
        } = std::mem::replace(&mut self.step, Step::Done)
        else {
            return Err(PgWireError::Auth("unexpected SCRAM server-final".into()));
        };
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| PgWireError::Auth("SCRAM server-final is not UTF-8".into()))?;

        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(PgWireError::Auth(format!("SCRAM server error: {err}")));
        }
        let verifier = server_final
            .split(',')
            .find_map(|a| a.strip_prefix("v="))
            .ok_or_else(|| PgWireError::Auth("SCRAM server-final missing v=".into()))?;
        let verifier = B64
            .decode(verifier.trim())
            .map_err(|e| PgWireError::Auth(format!("SCRAM verifier is not base64: {e}")))?;

        let server_key = hmac(&salted_password, b"Server Key");
        let mut mac = HmacSha256::new_from_slice(&server_key)
            .map_err(|e| PgWireError::Internal(e.to_string()))?;
        mac.update(auth_message.as_bytes());
        // constant time comparison
        mac.verify_slice(&verifier)
            .map_err(|_| PgWireError::Auth("SCRAM server signature mismatch".into()))
    }
}

fn hmac(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length is always valid");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Hi() from RFC 5802, i.e. PBKDF2-HMAC-SHA-256 with a single block.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac(password, &block);
    let mut out = u;
    for _ in 1..iterations {
        u = hmac(password, &u);
        out.iter_mut().zip(u).for_each(|(o, x)| *o ^= x);
    }
    out
}
