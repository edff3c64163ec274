//! Proof Key for Code Exchange (RFC 7636).
//!
//! The challenge is recorded when the code is issued; the verifier is
//! evaluated once, when the code is exchanged.

use base64ct::{Base64UrlUnpadded, Encoding};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

const CHALLENGE_PATTERN: &str = r"^[A-Za-z0-9._~-]{43,128}$";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "plain")]
    Plain,
    S256,
}

impl CodeChallengeMethod {
    /// # Errors
    /// Returns `Validation` for an unknown method name.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(Self::None),
            "plain" => Ok(Self::Plain),
            "S256" => Ok(Self::S256),
            other => Err(Error::validation(format!(
                "unsupported code_challenge_method {other:?}"
            ))),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Plain => "plain",
            Self::S256 => "S256",
        }
    }
}

fn well_formed(value: &str) -> bool {
    Regex::new(CHALLENGE_PATTERN).is_ok_and(|re| re.is_match(value))
}

/// Check an authorize request's challenge against what the client requires.
///
/// # Errors
/// Returns `Validation` when a challenge is missing, unexpected, malformed,
/// or uses another method than the client's.
pub fn validate_challenge(
    required: CodeChallengeMethod,
    challenge: Option<&str>,
    method: Option<&str>,
) -> Result<()> {
    let method = CodeChallengeMethod::parse(method.unwrap_or(match challenge {
        // RFC 7636 4.3: a bare challenge defaults to plain.
        Some(_) => "plain",
        None => "none",
    }))?;

    match (required, challenge) {
        (CodeChallengeMethod::None, None) => Ok(()),
        (CodeChallengeMethod::None, Some(_)) => Err(Error::validation(
            "client is not configured for code challenge",
        )),
        (_, None) => Err(Error::validation("code_challenge is required")),
        (required, Some(challenge)) => {
            if method != required {
                return Err(Error::validation(format!(
                    "code_challenge_method must be {}",
                    required.as_str()
                )));
            }
            if !well_formed(challenge) {
                return Err(Error::validation("malformed code_challenge"));
            }
            Ok(())
        }
    }
}

/// Does `verifier` answer `challenge`?
#[must_use]
pub fn verify(method: CodeChallengeMethod, challenge: &str, verifier: Option<&str>) -> bool {
    let Some(verifier) = verifier else {
        return method == CodeChallengeMethod::None;
    };
    if !well_formed(verifier) {
        return false;
    }
    let computed = match method {
        CodeChallengeMethod::None => return false,
        CodeChallengeMethod::Plain => verifier.to_string(),
        CodeChallengeMethod::S256 => {
            Base64UrlUnpadded::encode_string(&Sha256::digest(verifier.as_bytes()))
        }
    };
    bool::from(computed.as_bytes().ct_eq(challenge.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7636 appendix B.
    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn rfc_example_verifies() {
        assert!(verify(CodeChallengeMethod::S256, CHALLENGE, Some(VERIFIER)));
        assert!(!verify(CodeChallengeMethod::S256, CHALLENGE, Some(CHALLENGE)));
        assert!(!verify(CodeChallengeMethod::S256, CHALLENGE, None));
        assert!(verify(CodeChallengeMethod::Plain, VERIFIER, Some(VERIFIER)));
        assert!(!verify(CodeChallengeMethod::Plain, VERIFIER, Some("short")));
    }

    #[test]
    fn challenge_must_follow_client_policy() {
        use CodeChallengeMethod::{None as Off, S256};
        assert!(validate_challenge(Off, None, None).is_ok());
        assert!(validate_challenge(Off, Some(CHALLENGE), Some("S256")).is_err());
        assert!(validate_challenge(S256, None, None).is_err());
        assert!(validate_challenge(S256, Some(CHALLENGE), Some("S256")).is_ok());
        assert!(validate_challenge(S256, Some(CHALLENGE), None).is_err());
        assert!(validate_challenge(S256, Some("too-short"), Some("S256")).is_err());
        assert!(validate_challenge(S256, Some(CHALLENGE), Some("S512")).is_err());
    }
}
