// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of computility.
//
// computility is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// computility is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with computility.  If not,
// see <http://www.gnu.org/licenses/>.

//! # computility Access Tokens
//!
//! Web callers present a [JWT] (HS256) naming them in the `sub` claim. We only verify these; the
//! minting half is here for tooling & tests.
//!
//! [JWT]: https://www.rfc-editor.org/rfc/rfc7519.html

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use jwt::{Header, SignWithKey, Token, VerifyWithKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use snafu::{Backtrace, prelude::*};

use crate::{
    entities::Account,
    signing_keys::{self, KeyId, SigningKey, SigningKeys},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Token expired at {expires}"))]
    Expired {
        expires: DateTime<Utc>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create an HMAC: {source}"))]
    Hmac {
        source: hmac::digest::InvalidLength,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to refine a string to a KeyId: {source}"))]
    KeyId {
        source: signing_keys::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The Key ID was missing from the JWT"))]
    MissingKeyId { backtrace: Backtrace },
    #[snafu(display("No signing key matching {keyid}: {source}"))]
    NoKey {
        keyid: KeyId,
        source: signing_keys::Error,
    },
    #[snafu(display("Invalid token: not before {not_before}"))]
    NotBefore {
        not_before: DateTime<Utc>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse JWT: {source}"))]
    Parse {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to sign JWT claims: {source}"))]
    Signature {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown token issuer {issuer}"))]
    UnknownIssuer { issuer: String, backtrace: Backtrace },
    #[snafu(display("Verification failure: {source}"))]
    Verification {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// computility access [JWT] claims
#[derive(Clone, Debug, Deserialize, Serialize)]
struct AccessClaims {
    #[serde(rename = "iat")]
    issued_at: DateTime<Utc>,
    #[serde(rename = "iss")]
    issuer: String,
    #[serde(rename = "nbf")]
    not_before: DateTime<Utc>,
    #[serde(rename = "exp")]
    expires: DateTime<Utc>,
    #[serde(rename = "sub")]
    subject: Account,
}

fn hmac(signing_key: &SigningKey) -> Result<Hmac<Sha256>> {
    Hmac::new_from_slice(signing_key.as_ref()).context(HmacSnafu)
}

/// Mint a new JWT
///
/// Mint a new token naming `user_name`, signed using `signing_key` (identified by `keyid`). The
/// token will be valid for duration `lifetime`.
///
/// The fully serialized JWT will be returned.
pub fn mint_token(
    user_name: &Account,
    keyid: &KeyId,
    signing_key: &SigningKey,
    issuer: &str,
    lifetime: &Duration,
) -> Result<String> {
    let header = Header {
        key_id: Some(keyid.to_string()),
        ..Default::default()
    };
    let now = Utc::now();
    let claims = AccessClaims {
        issued_at: now,
        issuer: issuer.to_owned(),
        not_before: now,
        expires: now + *lifetime,
        subject: user_name.clone(),
    };
    Ok(Token::new(header, claims)
        .sign_with_key(&hmac(signing_key)?)
        .context(SignatureSnafu)?
        .as_str()
        .to_owned())
}

/// Verify `token_string` & return the user it names
pub fn verify_token(token_string: &str, keys: &SigningKeys, issuer: &str) -> Result<Account> {
    let token: Token<Header, AccessClaims, _> =
        Token::parse_unverified(token_string).context(ParseSnafu)?;
    let keyid = token
        .header()
        .key_id
        .clone()
        .context(MissingKeyIdSnafu)?;
    let keyid = KeyId::new(&keyid).context(KeyIdSnafu)?;
    let signing_key = keys.find_by_version(&keyid).context(NoKeySnafu { keyid })?;
    let token: Token<Header, AccessClaims, _> = token_string
        .verify_with_key(&hmac(&signing_key)?)
        .context(VerificationSnafu)?;
    let claims = token.claims();

    let now = Utc::now();
    ensure!(
        now >= claims.not_before,
        NotBeforeSnafu {
            not_before: claims.not_before
        }
    );
    ensure!(
        now <= claims.expires,
        ExpiredSnafu {
            expires: claims.expires
        }
    );
    ensure!(
        issuer == claims.issuer,
        UnknownIssuerSnafu {
            issuer: claims.issuer.clone()
        }
    );

    Ok(claims.subject.clone())
}

#[cfg(test)]
mod test {
    use super::*;

    fn keys() -> (KeyId, SigningKey, SigningKeys) {
        let keyid = KeyId::new("keyid:20250817").unwrap();
        // With apologies to J.R.R. Tolkein, but I needed 64 bytes exactly.
        let key = SigningKey::new(
            b"All that is gold does not glitter-- Not all who wander are lost.".to_vec(),
        )
        .unwrap();
        let keys = SigningKeys::from([(keyid.clone(), key.clone())]);
        (keyid, key, keys)
    }

    #[test]
    fn verify_minted_token() {
        let (keyid, key, keys) = keys();
        let alice = Account::new("alice").unwrap();
        let token =
            mint_token(&alice, &keyid, &key, "computility", &Duration::seconds(300)).unwrap();
        assert_eq!(verify_token(&token, &keys, "computility").unwrap(), alice);
    }

    #[test]
    fn reject_bad_tokens() {
        let (keyid, key, keys) = keys();
        let alice = Account::new("alice").unwrap();

        let expired =
            mint_token(&alice, &keyid, &key, "computility", &Duration::seconds(-10)).unwrap();
        assert!(matches!(
            verify_token(&expired, &keys, "computility"),
            Err(Error::Expired { .. })
        ));

        let token =
            mint_token(&alice, &keyid, &key, "computility", &Duration::seconds(300)).unwrap();
        assert!(matches!(
            verify_token(&token, &keys, "elsewhere"),
            Err(Error::UnknownIssuer { .. })
        ));
        assert!(matches!(
            verify_token(&token, &SigningKeys::default(), "computility"),
            Err(Error::NoKey { .. })
        ));

        // Signed with a different key under the same name
        let other = SigningKey::new(vec![7; 64]).unwrap();
        let forged =
            mint_token(&alice, &keyid, &other, "computility", &Duration::seconds(300)).unwrap();
        assert!(matches!(
            verify_token(&forged, &keys, "computility"),
            Err(Error::Verification { .. })
        ));

        assert!(verify_token("not-a-jwt", &keys, "computility").is_err());
    }
}
