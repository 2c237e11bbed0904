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

//! # util
//!
//! Much as I loathe catch-all "utility" modules, I truly don't know where these belong.

use std::{fmt::Display, ops::Deref};

use lazy_static::lazy_static;
use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use tap::Pipe;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          exactly_two                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub struct ExactlyTwoError {
    count: usize,
}

impl Display for ExactlyTwoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.count {
            0 => write!(f, "ExactlyTwoError: no elements"),
            1 => write!(f, "ExactlyTwoError: One element"),
            _ => write!(f, "ExactlyTwoError: Three or more elements"),
        }
    }
}

impl std::error::Error for ExactlyTwoError {}

pub fn exactly_two<T>(mut iter: T) -> std::result::Result<(T::Item, T::Item), ExactlyTwoError>
where
    T: std::iter::Iterator,
{
    match (iter.next(), iter.next(), iter.next()) {
        (Some(first), Some(second), None) => Ok((first, second)),
        (None, _, _) => Err(ExactlyTwoError { count: 0 }),
        (Some(_), None, _) => Err(ExactlyTwoError { count: 1 }),
        (Some(_), Some(_), Some(_)) => Err(ExactlyTwoError { count: 3 }),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           TableName                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref TABLE_NAME: Regex = Regex::new("^[a-z_][a-z0-9_]{0,62}$").unwrap(/* known good */);
}

#[derive(Debug)]
pub struct BadTableName(String);

impl Display for BadTableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} is not a legal table name", self.0)
    }
}

impl std::error::Error for BadTableName {}

/// A table name that's safe to interpolate into a statement
///
/// Table names are configurable, and neither SQL nor CQL let us bind them as parameters, so they
/// wind up formatted into statement text. This type restricts them to lower-case identifiers.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: &str) -> std::result::Result<TableName, BadTableName> {
        if TABLE_NAME.is_match(name) {
            Ok(TableName(name.to_owned()))
        } else {
            Err(BadTableName(name.to_owned()))
        }
    }
}

impl Deref for TableName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for TableName {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        <String as Deserialize>::deserialize(deserializer)?
            .pipe(|s| TableName::new(&s))
            .map_err(|err| <D::Error as serde::de::Error>::custom(format!("{}", err)))
    }
}

/// The names of the tables in which computility keeps its state
#[derive(Clone, Debug, Deserialize)]
pub struct Tables {
    #[serde(rename = "computility-org")]
    pub org: TableName,
    #[serde(rename = "computility-detail")]
    pub detail: TableName,
    #[serde(rename = "computility-account")]
    pub account: TableName,
    #[serde(rename = "computility-account-record")]
    pub account_record: TableName,
    #[serde(rename = "background-tasks")]
    pub tasks: TableName,
}

impl Default for Tables {
    fn default() -> Self {
        Tables {
            org: TableName("computility_org".to_owned()),
            detail: TableName("computility_detail".to_owned()),
            account: TableName("computility_account".to_owned()),
            account_record: TableName("computility_account_record".to_owned()),
            tasks: TableName("background_tasks".to_owned()),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      generic credentials                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// General-purpose credentials-- presumably username, password
// Not sure that the username should be secret, but why not?
#[derive(Clone, Debug, Deserialize)]
pub struct Credentials(pub (SecretString, SecretString));

impl clap::builder::ValueParserFactory for Credentials {
    type Parser = CredentialsParser;

    fn value_parser() -> Self::Parser {
        CredentialsParser
    }
}

#[derive(Clone, Debug)]
pub struct CredentialsParser;

impl clap::builder::TypedValueParser for CredentialsParser {
    type Value = Credentials;

    fn parse_ref(
        &self,
        _cmd: &clap::Command,
        _arg: Option<&clap::Arg>,
        value: &std::ffi::OsStr,
    ) -> std::result::Result<Self::Value, clap::Error> {
        use clap::error::ErrorKind;
        value
            .to_str()
            .ok_or(clap::Error::new(ErrorKind::InvalidValue))?
            .split(',')
            .pipe(exactly_two)
            .map_err(|_| clap::Error::new(ErrorKind::WrongNumberOfValues))?
            .pipe(|p| (p.0.into(), p.1.into()))
            .pipe(Credentials)
            .pipe(Ok)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn two_and_only_two() {
        assert_eq!(exactly_two("a,b".split(',')).unwrap(), ("a", "b"));
        assert!(exactly_two("a".split(',')).is_err());
        assert!(exactly_two("a,b,c".split(',')).is_err());
    }

    #[test]
    fn table_names() {
        assert!(TableName::new("computility_account").is_ok());
        assert!(TableName::new("accounts; drop table x").is_err());
        assert!(TableName::new("Accounts").is_err());
        assert!(TableName::new("").is_err());
        let tables: Tables = toml::from_str(
            r#"
computility-org = "orgs"
computility-detail = "details"
computility-account = "accounts"
computility-account-record = "records"
background-tasks = "tasks"
"#,
        )
        .unwrap();
        assert_eq!(&*tables.account, "accounts");
        assert!(
            toml::from_str::<Tables>(
                r#"
computility-org = "Orgs!"
computility-detail = "details"
computility-account = "accounts"
computility-account-record = "records"
background-tasks = "tasks"
"#
            )
            .is_err()
        );
    }
}
