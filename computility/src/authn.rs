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

//! # computility authentication support
//!
//! computility has two kinds of callers:
//!
//! 1. other services in the deployment, calling the internal endpoints; they present a shared
//!    secret in the `TOKEN` header
//! 2. users, calling through the web front end with a JWT in the `Authorization` header
//!
//! We never store the internal token itself, only the hex-encoded HMAC-SHA256 of it keyed with a
//! salt; see [InternalToken].

use axum::http::{HeaderMap, HeaderValue};
use hmac::{Hmac, Mac};
use itertools::Itertools;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use snafu::{Backtrace, prelude::*};
use tap::Pipe;

use crate::{
    entities::Account,
    signing_keys::SigningKeys,
    token::{self, verify_token},
    util::exactly_two,
};

/// The header carrying the internal token (`TOKEN`; header names are case-insensitive)
pub const TOKEN_HEADER: &str = "token";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("An Authorization header had a value that couldn't be parsed."))]
    BadAuthHeaderParse {
        value: HeaderValue,
        backtrace: Backtrace,
    },
    #[snafu(display("The configured internal token hash isn't valid hex: {source}"))]
    BadTokenHash {
        source: hex::FromHexError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create an HMAC: {source}"))]
    Hmac {
        source: hmac::digest::InvalidLength,
        backtrace: Backtrace,
    },
    #[snafu(display("An Authorization header had a non-textual value: {source}"))]
    InvalidAuthHeaderValue {
        value: HeaderValue,
        source: axum::http::header::ToStrError,
        backtrace: Backtrace,
    },
    #[snafu(display("The internal token didn't match"))]
    InvalidInternalToken { backtrace: Backtrace },
    #[snafu(display("Invalid token: {source}"))]
    InvalidToken {
        source: token::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Multiple {name} headers"))]
    MultipleHeaders {
        name: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("No {name} header"))]
    NoHeader {
        name: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Unsupported authorization scheme {scheme}"))]
    UnsupportedAuthScheme { scheme: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

/// Fetch the one & only value of header `name`
///
/// Multiple values smell like someone trying something fishy, so we reject them.
fn sole_header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a HeaderValue> {
    headers
        .get_all(name)
        .into_iter()
        .at_most_one()
        .map_err(|_| MultipleHeadersSnafu { name }.build())?
        .context(NoHeaderSnafu { name })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         internal token                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The internal token, as configured
///
/// ```toml
/// [internal-token]
/// salt = "..."
/// hash = "hex-encoded HMAC-SHA256 of the token, keyed with the salt"
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct InternalToken {
    salt: SecretString,
    hash: SecretString,
}

impl InternalToken {
    pub fn new(salt: SecretString, hash: SecretString) -> InternalToken {
        InternalToken { salt, hash }
    }
    /// Compute the hash we'd expect to have configured for `token`
    pub fn hash_token(salt: &SecretString, token: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(salt.expose_secret().as_bytes())
            .context(HmacSnafu)?;
        mac.update(token.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
    /// Check the internal token carried by `headers`
    pub fn check(&self, headers: &HeaderMap) -> Result<()> {
        let presented = sole_header(headers, TOKEN_HEADER)?;
        let mut mac = Hmac::<Sha256>::new_from_slice(self.salt.expose_secret().as_bytes())
            .context(HmacSnafu)?;
        mac.update(presented.as_bytes());
        let expected = hex::decode(self.hash.expose_secret().trim()).context(BadTokenHashSnafu)?;
        // `verify_slice` compares in constant time
        mac.verify_slice(&expected)
            .map_err(|_| InvalidInternalTokenSnafu.build())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          bearer tokens                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Pull the JWT out of an `Authorization: Bearer ...` header
pub fn bearer_token(headers: &HeaderMap) -> Result<String> {
    let value = sole_header(headers, "authorization")?;
    let (scheme, payload) = value
        .to_str()
        .context(InvalidAuthHeaderValueSnafu {
            value: value.clone(),
        })?
        .split_ascii_whitespace()
        .pipe(exactly_two)
        .map_err(|_| {
            BadAuthHeaderParseSnafu {
                value: value.clone(),
            }
            .build()
        })?;
    ensure!(
        scheme.eq_ignore_ascii_case("bearer"),
        UnsupportedAuthSchemeSnafu {
            scheme: scheme.to_owned()
        }
    );
    Ok(payload.to_owned())
}

/// Authenticate a web caller; on success, return the user named by their token
pub fn check_bearer(headers: &HeaderMap, keys: &SigningKeys, issuer: &str) -> Result<Account> {
    verify_token(&bearer_token(headers)?, keys, issuer).context(InvalidTokenSnafu)
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Duration;

    use crate::{
        signing_keys::{KeyId, SigningKey},
        token::mint_token,
    };

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(*name, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn internal_tokens() {
        let salt: SecretString = "pepper".into();
        let hash = InternalToken::hash_token(&salt, "sesame").unwrap();
        let token = InternalToken::new(salt, hash.into());

        assert!(token.check(&headers(&[("token", "sesame")])).is_ok());
        assert!(matches!(
            token.check(&headers(&[("token", "sesam")])),
            Err(Error::InvalidInternalToken { .. })
        ));
        assert!(matches!(
            token.check(&headers(&[])),
            Err(Error::NoHeader { .. })
        ));
        assert!(matches!(
            token.check(&headers(&[("token", "sesame"), ("token", "sesame")])),
            Err(Error::MultipleHeaders { .. })
        ));

        // Unconfigured; nothing gets through
        let token = InternalToken::new("".into(), "".into());
        assert!(matches!(
            token.check(&headers(&[("token", "")])),
            Err(Error::InvalidInternalToken { .. })
        ));
    }

    #[test]
    fn bearer_tokens() {
        let keyid = KeyId::new("keyid:20250817").unwrap();
        let key = SigningKey::new(vec![42; 64]).unwrap();
        let keys = SigningKeys::from([(keyid.clone(), key.clone())]);
        let alice = Account::new("alice").unwrap();
        let jwt = mint_token(&alice, &keyid, &key, "computility", &Duration::seconds(60)).unwrap();

        let user = check_bearer(
            &headers(&[("authorization", &format!("Bearer {jwt}"))]),
            &keys,
            "computility",
        )
        .unwrap();
        assert_eq!(user, alice);

        assert!(matches!(
            check_bearer(
                &headers(&[("authorization", &format!("Basic {jwt}"))]),
                &keys,
                "computility"
            ),
            Err(Error::UnsupportedAuthScheme { .. })
        ));
        assert!(matches!(
            check_bearer(
                &headers(&[("authorization", "Bearer")]),
                &keys,
                "computility"
            ),
            Err(Error::BadAuthHeaderParse { .. })
        ));
        assert!(matches!(
            check_bearer(
                &headers(&[("authorization", "Bearer abc.def.ghi")]),
                &keys,
                "computility"
            ),
            Err(Error::InvalidToken { .. })
        ));
    }
}
