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

//! # computility models
//!
//! ## Introduction
//!
//! The four aggregates this service keeps (accounts, details, orgs & account records) along with
//! the refined types from which they're built.
//!
//! ## Quota arithmetic
//!
//! The balance-changing operations are methods on the entities themselves, & they never mutate in
//! place: each returns the *next* version of the row (with `version` bumped by one). The storage
//! layer then writes that row conditionally on the prior version still being current. That keeps
//! the arithmetic (& its invariants) in one place, independent of any particular backend.

use std::{fmt::Display, ops::Deref, str::FromStr};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use scylla::{
    DeserializeRow,
    deserialize::{DeserializationError, FrameSlice, TypeCheckError, value::DeserializeValue},
    frame::response::result::ColumnType,
    serialize::{
        SerializationError,
        value::SerializeValue,
        writers::{CellWriter, WrittenCellProof},
    },
};
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{Backtrace, prelude::*};
use uuid::Uuid;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid account name"))]
    BadAccount { text: String, backtrace: Backtrace },
    #[snafu(display("Quota amounts must be positive; got {amount}"))]
    BadAmount { amount: i64, backtrace: Backtrace },
    #[snafu(display("{text} is not a supported compute type"))]
    BadComputeType { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid space identifier"))]
    BadSpaceId { text: String, backtrace: Backtrace },
    #[snafu(display(
        "User {user_name} has a balance of {balance}, which is insufficient to consume {requested}"
    ))]
    InsufficientQuota {
        user_name: Account,
        balance: i64,
        requested: i64,
        backtrace: Backtrace,
    },
    #[snafu(display("User {user_name} has no quota in use"))]
    NoUsedQuota {
        user_name: Account,
        backtrace: Backtrace,
    },
    #[snafu(display("Assigning {amount} more to {name}'s {total} would overflow"))]
    QuotaOverflow {
        name: Account,
        total: i64,
        amount: i64,
        backtrace: Backtrace,
    },
    #[snafu(display("User {user_name} has {used} in use; can't release {requested}"))]
    ReleaseExceedsUsage {
        user_name: Account,
        used: i64,
        requested: i64,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

fn mk_de_err(err: impl std::error::Error + Send + Sync + 'static) -> DeserializationError {
    DeserializationError::new(err)
}

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

/// Check that a quota amount supplied by a caller is positive
pub fn check_amount(amount: i64) -> Result<i64> {
    ensure!(amount > 0, BadAmountSnafu { amount });
    Ok(amount)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Declare a newtype around [Uuid] to serve as the opaque identifier for some entity
///
/// None of our backends can be counted on for an auto-increment column, so rows are identified by
/// v4 UUIDs that we mint ourselves. The resulting type implements [Display], [FromStr], the serde
/// traits (transparently) & the ScyllaDB [DeserializeValue] & [SerializeValue] traits.
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $type_name(Uuid);
        impl $type_name {
            pub fn new(s: &str) -> StdResult<$type_name, uuid::Error> {
                Ok($type_name(Uuid::parse_str(s)?))
            }
        }
        impl Default for $type_name {
            fn default() -> Self {
                $type_name(Uuid::new_v4())
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }
        impl FromStr for $type_name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                $type_name::new(s)
            }
        }
        impl Deref for $type_name {
            type Target = Uuid;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
        impl From<Uuid> for $type_name {
            fn from(value: Uuid) -> Self {
                $type_name(value)
            }
        }
        impl From<$type_name> for Uuid {
            fn from(value: $type_name) -> Self {
                value.0
            }
        }
        // The derive macro doesn't work with newtype structs.
        impl<'frame, 'metadata> DeserializeValue<'frame, 'metadata> for $type_name {
            fn type_check(typ: &ColumnType<'_>) -> StdResult<(), TypeCheckError> {
                Uuid::type_check(typ)
            }
            fn deserialize(
                typ: &'metadata ColumnType<'metadata>,
                v: Option<FrameSlice<'frame>>,
            ) -> StdResult<Self, DeserializationError> {
                Ok(Self(<Uuid as DeserializeValue>::deserialize(typ, v)?))
            }
        }
        impl SerializeValue for $type_name {
            fn serialize<'b>(
                &self,
                typ: &ColumnType<'_>,
                writer: CellWriter<'b>,
            ) -> StdResult<WrittenCellProof<'b>, SerializationError> {
                SerializeValue::serialize(&self.0, typ, writer)
            }
        }
    };
}

define_id!(AccountId);
define_id!(DetailId);
define_id!(OrgId);
define_id!(RecordId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     refined string types                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Declare a refined newtype around [String]
///
/// `$check` is a `fn(&str) -> bool`; `$err` the context selector to use when it fails. Writing
/// these by hand involves a *lot* of boilerplate.
macro_rules! define_refined_str {
    ($type_name:ident, $check:expr, $err:ident) => {
        #[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $type_name(String);

        impl $type_name {
            pub fn new(text: &str) -> Result<$type_name> {
                $check(text)
                    .then_some($type_name(text.to_owned()))
                    .ok_or($err {
                        text: text.to_owned(),
                    }
                    .build())
            }
        }

        impl AsRef<str> for $type_name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Deref for $type_name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        // Implement `Deserialize` by hand to fail if the serialized value doesn't check out
        impl<'de> Deserialize<'de> for $type_name {
            fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                $type_name::try_from(s).map_err(mk_serde_de_err::<'de, D>)
            }
        }

        impl<'frame, 'metadata> DeserializeValue<'frame, 'metadata> for $type_name {
            fn type_check(typ: &ColumnType<'_>) -> StdResult<(), TypeCheckError> {
                String::type_check(typ)
            }
            fn deserialize(
                typ: &'metadata ColumnType<'metadata>,
                v: Option<FrameSlice<'frame>>,
            ) -> StdResult<Self, DeserializationError> {
                $type_name::try_from(<String as DeserializeValue>::deserialize(typ, v)?)
                    .map_err(mk_de_err)
            }
        }

        impl SerializeValue for $type_name {
            fn serialize<'b>(
                &self,
                typ: &ColumnType<'_>,
                writer: CellWriter<'b>,
            ) -> StdResult<WrittenCellProof<'b>, SerializationError> {
                SerializeValue::serialize(&self.0, typ, writer)
            }
        }

        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $type_name {
            type Err = Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                $type_name::new(s)
            }
        }

        impl TryFrom<String> for $type_name {
            type Error = Error;

            fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
                if $check(&text) {
                    Ok($type_name(text))
                } else {
                    $err { text }.fail()
                }
            }
        }
    };
}

// Account names (for both users & orgs) must be ASCII, from five to fifty characters in length, &
// match "^[a-zA-Z0-9_-]+$".
const MIN_ACCOUNT_LENGTH: usize = 5;
const MAX_ACCOUNT_LENGTH: usize = 50;

const MAX_SPACE_ID_LENGTH: usize = 64;

lazy_static! {
    static ref ACCOUNT: Regex = Regex::new("^[a-zA-Z0-9_-]+$").unwrap(/* known good */);
    static ref SPACE_ID: Regex = Regex::new("^[-a-zA-Z0-9_.]+$").unwrap(/* known good */);
}

fn check_account(s: &str) -> bool {
    s.len() >= MIN_ACCOUNT_LENGTH && s.len() <= MAX_ACCOUNT_LENGTH && ACCOUNT.is_match(s)
}

fn check_space_id(s: &str) -> bool {
    s.len() <= MAX_SPACE_ID_LENGTH && SPACE_ID.is_match(s)
}

define_refined_str!(Account, check_account, BadAccountSnafu);
define_refined_str!(SpaceId, check_space_id, BadSpaceIdSnafu);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          ComputeType                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The category of hardware against which quota is tracked
///
/// Parsed case-insensitively; always rendered in lower case. CPU is free: quota operations against
/// it are no-ops.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeType {
    Npu,
    Cpu,
}

impl ComputeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeType::Npu => "npu",
            ComputeType::Cpu => "cpu",
        }
    }
    pub fn is_cpu(&self) -> bool {
        matches!(self, ComputeType::Cpu)
    }
}

impl Display for ComputeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ComputeType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "npu" => Ok(ComputeType::Npu),
            "cpu" => Ok(ComputeType::Cpu),
            _ => BadComputeTypeSnafu { text: s.to_owned() }.fail(),
        }
    }
}

impl<'de> Deserialize<'de> for ComputeType {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse::<ComputeType>().map_err(mk_serde_de_err::<'de, D>)
    }
}

impl<'frame, 'metadata> DeserializeValue<'frame, 'metadata> for ComputeType {
    fn type_check(typ: &ColumnType<'_>) -> StdResult<(), TypeCheckError> {
        String::type_check(typ)
    }
    fn deserialize(
        typ: &'metadata ColumnType<'metadata>,
        v: Option<FrameSlice<'frame>>,
    ) -> StdResult<Self, DeserializationError> {
        <String as DeserializeValue>::deserialize(typ, v)?
            .parse::<ComputeType>()
            .map_err(mk_de_err)
    }
}

impl SerializeValue for ComputeType {
    fn serialize<'b>(
        &self,
        typ: &ColumnType<'_>,
        writer: CellWriter<'b>,
    ) -> StdResult<WrittenCellProof<'b>, SerializationError> {
        SerializeValue::serialize(&self.as_str(), typ, writer)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            indices                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Locates a [ComputilityAccount]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AccountIndex {
    pub user_name: Account,
    pub compute_type: ComputeType,
}

/// Locates the [ComputilityDetail]s for one member of one org
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DetailIndex {
    pub org_name: Account,
    pub user_name: Account,
}

/// Locates a [ComputilityAccountRecord]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RecordIndex {
    pub user_name: Account,
    pub space_id: SpaceId,
    pub compute_type: ComputeType,
}

impl RecordIndex {
    pub fn account_index(&self) -> AccountIndex {
        AccountIndex {
            user_name: self.user_name.clone(),
            compute_type: self.compute_type,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       ComputilityAccount                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One user's quota for one compute type
///
/// `quota_count` is everything assigned to this user (across all orgs), `used_quota` how much of
/// that is currently consumed. `0 <= used_quota <= quota_count` always holds for rows produced by
/// the methods below.
#[derive(Clone, Debug, Deserialize, DeserializeRow, PartialEq, Serialize)]
pub struct ComputilityAccount {
    pub id: AccountId,
    pub user_name: Account,
    pub compute_type: ComputeType,
    pub quota_count: i64,
    pub used_quota: i64,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl ComputilityAccount {
    /// A brand-new account with nothing assigned
    pub fn new(user_name: &Account, compute_type: ComputeType) -> ComputilityAccount {
        ComputilityAccount {
            id: AccountId::default(),
            user_name: user_name.clone(),
            compute_type,
            quota_count: 0,
            used_quota: 0,
            created_at: Utc::now(),
            version: 0,
        }
    }
    pub fn index(&self) -> AccountIndex {
        AccountIndex {
            user_name: self.user_name.clone(),
            compute_type: self.compute_type,
        }
    }
    /// Quota assigned but not in use
    pub fn balance(&self) -> i64 {
        self.quota_count - self.used_quota
    }
    /// An account with nothing assigned & nothing in use may be cancelled
    pub fn is_cancellable(&self) -> bool {
        self.quota_count == 0 && self.used_quota == 0
    }
    fn next(&self, quota_count: i64, used_quota: i64) -> ComputilityAccount {
        ComputilityAccount {
            quota_count,
            used_quota,
            version: self.version + 1,
            ..self.clone()
        }
    }
    /// Assign `amount` more quota to this account
    pub fn assigned(&self, amount: i64) -> Result<ComputilityAccount> {
        let quota_count = self
            .quota_count
            .checked_add(amount)
            .context(QuotaOverflowSnafu {
                name: self.user_name.clone(),
                total: self.quota_count,
                amount,
            })?;
        Ok(self.next(quota_count, self.used_quota))
    }
    /// Take back `amount` of the assigned quota
    ///
    /// If the user is using more than would remain, usage is written down to the new total; the
    /// difference is exactly the amount to be recalled (see [ComputilityAccount::debt]).
    pub fn recalled(&self, amount: i64) -> ComputilityAccount {
        let quota_count = (self.quota_count - amount).max(0);
        self.next(quota_count, self.used_quota.min(quota_count))
    }
    /// The amount of quota that must be recalled from this user if `assigned` is taken back
    pub fn debt(&self, assigned: i64) -> i64 {
        (assigned - self.balance()).max(0)
    }
    /// Consume `amount` of this account's balance
    pub fn consumed(&self, amount: i64) -> Result<ComputilityAccount> {
        let amount = check_amount(amount)?;
        ensure!(
            self.balance() >= amount,
            InsufficientQuotaSnafu {
                user_name: self.user_name.clone(),
                balance: self.balance(),
                requested: amount,
            }
        );
        Ok(self.next(self.quota_count, self.used_quota + amount))
    }
    /// Release `amount` of this account's usage
    pub fn released(&self, amount: i64) -> Result<ComputilityAccount> {
        let amount = check_amount(amount)?;
        ensure!(
            self.used_quota > 0,
            NoUsedQuotaSnafu {
                user_name: self.user_name.clone(),
            }
        );
        ensure!(
            self.used_quota >= amount,
            ReleaseExceedsUsageSnafu {
                user_name: self.user_name.clone(),
                used: self.used_quota,
                requested: amount,
            }
        );
        Ok(self.next(self.quota_count, self.used_quota - amount))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       ComputilityDetail                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The quota one org assigned to one of its members
#[derive(Clone, Debug, Deserialize, DeserializeRow, PartialEq, Serialize)]
pub struct ComputilityDetail {
    pub id: DetailId,
    pub org_name: Account,
    pub user_name: Account,
    pub compute_type: ComputeType,
    pub quota_count: i64,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl ComputilityDetail {
    pub fn new(
        org_name: &Account,
        user_name: &Account,
        compute_type: ComputeType,
        quota_count: i64,
    ) -> ComputilityDetail {
        ComputilityDetail {
            id: DetailId::default(),
            org_name: org_name.clone(),
            user_name: user_name.clone(),
            compute_type,
            quota_count,
            created_at: Utc::now(),
            version: 0,
        }
    }
    pub fn index(&self) -> DetailIndex {
        DetailIndex {
            org_name: self.org_name.clone(),
            user_name: self.user_name.clone(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         ComputilityOrg                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An organization with compute enabled
///
/// `quota_count` is the total this org has assigned out to its members; each new member receives
/// `default_assign_quota`.
#[derive(Clone, Debug, Deserialize, DeserializeRow, PartialEq, Serialize)]
pub struct ComputilityOrg {
    pub id: OrgId,
    pub org_id: Uuid,
    pub org_name: Account,
    pub compute_type: ComputeType,
    pub quota_count: i64,
    pub used_quota: i64,
    pub default_assign_quota: i64,
    pub version: i64,
}

impl ComputilityOrg {
    pub fn new(
        org_id: Uuid,
        org_name: &Account,
        compute_type: ComputeType,
        default_assign_quota: i64,
    ) -> ComputilityOrg {
        ComputilityOrg {
            id: OrgId::default(),
            org_id,
            org_name: org_name.clone(),
            compute_type,
            quota_count: 0,
            used_quota: 0,
            default_assign_quota,
            version: 0,
        }
    }
    /// Record that `amount` more has been assigned to a member
    pub fn assigned(&self, amount: i64) -> Result<ComputilityOrg> {
        let quota_count = self
            .quota_count
            .checked_add(amount)
            .context(QuotaOverflowSnafu {
                name: self.org_name.clone(),
                total: self.quota_count,
                amount,
            })?;
        Ok(ComputilityOrg {
            quota_count,
            version: self.version + 1,
            ..self.clone()
        })
    }
    /// Record that `amount` has been taken back from a member
    pub fn recalled(&self, amount: i64) -> ComputilityOrg {
        ComputilityOrg {
            quota_count: (self.quota_count - amount).max(0),
            version: self.version + 1,
            ..self.clone()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    ComputilityAccountRecord                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The quota one of a user's spaces is consuming
#[derive(Clone, Debug, Deserialize, DeserializeRow, PartialEq, Serialize)]
pub struct ComputilityAccountRecord {
    pub id: RecordId,
    pub user_name: Account,
    pub space_id: SpaceId,
    pub compute_type: ComputeType,
    pub quota_count: i64,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl ComputilityAccountRecord {
    pub fn new(index: &RecordIndex, quota_count: i64) -> ComputilityAccountRecord {
        ComputilityAccountRecord {
            id: RecordId::default(),
            user_name: index.user_name.clone(),
            space_id: index.space_id.clone(),
            compute_type: index.compute_type,
            quota_count,
            created_at: Utc::now(),
            version: 0,
        }
    }
    /// Move this record to a re-created space
    pub fn rebound(&self, space_id: &SpaceId) -> ComputilityAccountRecord {
        ComputilityAccountRecord {
            space_id: space_id.clone(),
            version: self.version + 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn account(quota_count: i64, used_quota: i64) -> ComputilityAccount {
        ComputilityAccount {
            quota_count,
            used_quota,
            ..ComputilityAccount::new(&Account::new("alice").unwrap(), ComputeType::Npu)
        }
    }

    #[test]
    fn account_names() {
        assert!(Account::new("alice").is_ok());
        assert!(Account::new("team_ml-01").is_ok());
        assert!(Account::new("bob").is_err());
        assert!(Account::new("has space").is_err());
        assert!(Account::new(&"x".repeat(51)).is_err());
        assert!(serde_json::from_str::<Account>("\"ab\"").is_err());
    }

    #[test]
    fn compute_types() {
        assert_eq!("NPU".parse::<ComputeType>().unwrap(), ComputeType::Npu);
        assert_eq!("cpu".parse::<ComputeType>().unwrap(), ComputeType::Cpu);
        assert!("gpu".parse::<ComputeType>().is_err());
        assert_eq!(
            serde_json::to_string(&ComputeType::Npu).unwrap(),
            "\"npu\""
        );
        assert_eq!(
            serde_json::from_str::<ComputeType>("\"Npu\"").unwrap(),
            ComputeType::Npu
        );
    }

    #[test]
    fn consume_and_release() {
        let acct = account(10, 0);
        let acct = acct.consumed(5).unwrap();
        assert_eq!((acct.quota_count, acct.used_quota, acct.version), (10, 5, 1));
        assert!(matches!(
            acct.consumed(6),
            Err(Error::InsufficientQuota { balance: 5, .. })
        ));
        let acct = acct.consumed(5).unwrap();
        assert_eq!((acct.quota_count, acct.used_quota), (10, 10));
        assert!(matches!(acct.consumed(1), Err(Error::InsufficientQuota { .. })));
        assert!(matches!(
            acct.released(11),
            Err(Error::ReleaseExceedsUsage { .. })
        ));
        let acct = acct.released(10).unwrap();
        assert_eq!((acct.quota_count, acct.used_quota, acct.version), (10, 0, 3));
        assert!(matches!(acct.released(1), Err(Error::NoUsedQuota { .. })));
        assert!(matches!(acct.consumed(0), Err(Error::BadAmount { .. })));
    }

    #[test]
    fn recall_writes_down_usage() {
        // Three assigned, two in use: taking back all three leaves a debt of two
        let acct = account(3, 2);
        assert_eq!(acct.debt(3), 2);
        let acct = acct.recalled(3);
        assert_eq!((acct.quota_count, acct.used_quota), (0, 0));
        assert!(acct.is_cancellable());

        // Ten assigned (from two orgs), two in use: taking back three leaves no debt
        let acct = account(10, 2);
        assert_eq!(acct.debt(3), 0);
        let acct = acct.recalled(3);
        assert_eq!((acct.quota_count, acct.used_quota), (7, 2));
        assert!(!acct.is_cancellable());
    }

    #[test]
    fn assignment_overflow() {
        let acct = account(i64::MAX - 1, 0);
        assert_eq!(acct.assigned(1).unwrap().quota_count, i64::MAX);
        assert!(matches!(
            acct.assigned(2),
            Err(Error::QuotaOverflow { amount: 2, .. })
        ));

        let org = ComputilityOrg::new(
            Uuid::new_v4(),
            &Account::new("acme-corp").unwrap(),
            ComputeType::Npu,
            i64::MAX,
        );
        let org = org.assigned(i64::MAX).unwrap();
        assert!(matches!(
            org.assigned(i64::MAX),
            Err(Error::QuotaOverflow { .. })
        ));
    }
}
