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

//! # computility Signing Keys
//!
//! The web-facing endpoint authenticates callers by a JWT minted by the web front end. The keys
//! those tokens are signed with are shared with us through configuration, versioned so that they
//! can be rotated:
//!
//! ```toml
//! [signing-keys]
//! "keyid:2025-02-12" = "0a1b..." # 64 octets, hex-encoded
//! "keyid:2025-02-15" = "9f8e..."
//! ```
//!
//! Tokens name the key that signed them in their header, so an older key stays usable for
//! verification until the operator removes it. Versions compare lexicographically; the latest is
//! the "current" key, used when we mint tokens ourselves (the test suite does).

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use lazy_static::lazy_static;
use regex::Regex;
use secrecy::{ExposeSecret, SecretSlice};
use serde::{Deserialize, Deserializer};
use snafu::{Backtrace, Snafu, prelude::*};
use tap::Pipe;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to recognize {text} as a KeyId"))]
    KeyId { text: String, backtrace: Backtrace },
    #[snafu(display("No signing key available"))]
    NoKey { backtrace: Backtrace },
    #[snafu(display("Signing keys must be 64 octets in length"))]
    SigningKey { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             KeyId                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref KEY_ID : Regex = Regex::new("^keyid:[-0-9a-zA-Z]+$").unwrap(/* known good */);
}

#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(s: &str) -> Result<KeyId> {
        if KEY_ID.find(s).is_none() {
            KeyIdSnafu { text: s.to_owned() }.fail()
        } else {
            Ok(KeyId(s.to_owned()))
        }
    }
}

impl Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for KeyId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        KeyId::new(s)
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        <String as Deserialize>::deserialize(deserializer)?
            .pipe(|s| KeyId::new(&s))
            .map_err(|err| <D::Error as serde::de::Error>::custom(format!("{}", err)))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           SigningKey                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A refined type enforcing a key length (of 64 octets)
#[derive(Clone, Debug)]
pub struct SigningKey(SecretSlice<u8>);

impl SigningKey {
    pub fn new(b: Vec<u8>) -> Result<SigningKey> {
        ensure!(b.len() == 64, SigningKeySnafu);
        Ok(SigningKey(b.into()))
    }
}

impl AsRef<[u8]> for SigningKey {
    fn as_ref(&self) -> &[u8] {
        self.0.expose_secret()
    }
}

// Keys are written down in hex
impl<'de> Deserialize<'de> for SigningKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = <String as Deserialize>::deserialize(deserializer)?;
        hex::decode(text.trim())
            .map_err(|err| <D::Error as serde::de::Error>::custom(format!("{}", err)))?
            .pipe(SigningKey::new)
            .map_err(|err| <D::Error as serde::de::Error>::custom(format!("{}", err)))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          SigningKeys                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct SigningKeys {
    keys: BTreeMap<KeyId, SigningKey>,
}

impl SigningKeys {
    /// Retrieve the current (i.e. the most recent) SigningKey
    pub fn current(&self) -> Result<(KeyId, SigningKey)> {
        let (key, value) = self.keys.last_key_value().context(NoKeySnafu)?;
        Ok((key.clone(), value.clone()))
    }
    /// Retrieve a key by version
    pub fn find_by_version(&self, keyid: &KeyId) -> Result<SigningKey> {
        Ok(self.keys.get(keyid).context(NoKeySnafu)?.clone())
    }
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<const N: usize> From<[(KeyId, SigningKey); N]> for SigningKeys {
    fn from(value: [(KeyId, SigningKey); N]) -> Self {
        Self {
            keys: BTreeMap::from(value),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_ids() {
        assert!(KeyId::new("keyid:2025-02-12").is_ok());
        assert!(KeyId::new("2025-02-12").is_err());
        assert!(KeyId::new("keyid:").is_err());
    }

    #[test]
    fn from_config() {
        let keys: SigningKeys = toml::from_str(&format!(
            r#""keyid:20250212" = "{}"
"keyid:20250215" = "{}""#,
            "00".repeat(64),
            "ff".repeat(64)
        ))
        .unwrap();
        let (keyid, key) = keys.current().unwrap();
        assert_eq!(keyid, KeyId::new("keyid:20250215").unwrap());
        assert_eq!(key.as_ref(), &[0xff; 64]);
        assert!(
            keys.find_by_version(&KeyId::new("keyid:20250212").unwrap())
                .is_ok()
        );
        assert!(
            keys.find_by_version(&KeyId::new("keyid:20250101").unwrap())
                .is_err()
        );

        // Too short
        assert!(toml::from_str::<SigningKeys>(r#""keyid:20250212" = "0011""#).is_err());
    }
}
