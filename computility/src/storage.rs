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

//! # storage
//!
//! Abstractions for the computility storage layer.
//!
//! There are four stores (accounts, details, orgs & account records), each expressed as its own
//! object-safe trait; [Backend] ties them together. Reads return `Option`s: whether a missing row
//! is an error is for the caller to decide.
//!
//! Every update is a compare-and-swap: the caller passes the row as it read it (`prior`) & the row
//! it would like to see (`updated`), and the backend writes `updated` only if the stored version
//! still matches `prior.version`. If it doesn't (someone else got there first), the backend fails
//! with [Error::ConcurrentUpdate]; no backend retries on its own.
//!
//! Application operations generally touch several rows. They describe their writes as a slice of
//! [Write]s & hand them to [Backend::commit]. The default implementation applies them one at a time
//! in order, stopping at the first failure; backends that can do better (a SQL transaction, say)
//! override it so that the whole batch lands or none of it does.

use async_trait::async_trait;
use snafu::{Backtrace, prelude::*};

use crate::entities::{
    AccountIndex, ComputilityAccount, ComputilityAccountRecord, ComputilityDetail,
    ComputilityOrg, DetailId, DetailIndex, OrgId, RecordId, RecordIndex, Account,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("The {entity} row changed (or vanished) since it was read"))]
    ConcurrentUpdate {
        entity: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("A {entity} identified by {key} already exists"))]
    Duplicate {
        entity: &'static str,
        key: String,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Backend {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
    /// True if this error means an optimistic-locking conflict; such operations may be retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConcurrentUpdate { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-(user, compute type) quota balances
#[async_trait]
pub trait AccountStore {
    async fn add_account(&self, account: &ComputilityAccount) -> Result<()>;
    async fn account(&self, index: &AccountIndex) -> Result<Option<ComputilityAccount>>;
    async fn update_account(
        &self,
        prior: &ComputilityAccount,
        updated: &ComputilityAccount,
    ) -> Result<()>;
    /// Delete the account if (and only if) nothing is assigned to it & nothing is in use; return
    /// true if a row was deleted.
    async fn cancel_account(&self, index: &AccountIndex) -> Result<bool>;
}

/// Per-(org, user) assignments
#[async_trait]
pub trait DetailStore {
    async fn add_detail(&self, detail: &ComputilityDetail) -> Result<()>;
    /// The oldest assignment for this (org, user) pair
    async fn detail(&self, index: &DetailIndex) -> Result<Option<ComputilityDetail>>;
    /// Every assignment made by `org_name`, oldest first
    async fn org_members(&self, org_name: &Account) -> Result<Vec<ComputilityDetail>>;
    async fn delete_detail(&self, id: &DetailId) -> Result<()>;
}

/// Per-org aggregate quota
#[async_trait]
pub trait OrgStore {
    /// Fails with [Error::Duplicate] if an org by that name is already present
    async fn add_org(&self, org: &ComputilityOrg) -> Result<()>;
    async fn org(&self, org_name: &Account) -> Result<Option<ComputilityOrg>>;
    async fn update_org(&self, prior: &ComputilityOrg, updated: &ComputilityOrg) -> Result<()>;
    async fn delete_org(&self, id: &OrgId) -> Result<()>;
}

/// Per-(user, space) consumption records
#[async_trait]
pub trait RecordStore {
    async fn add_record(&self, record: &ComputilityAccountRecord) -> Result<()>;
    async fn record(&self, index: &RecordIndex) -> Result<Option<ComputilityAccountRecord>>;
    async fn records(&self, index: &AccountIndex) -> Result<Vec<ComputilityAccountRecord>>;
    async fn update_record(
        &self,
        prior: &ComputilityAccountRecord,
        updated: &ComputilityAccountRecord,
    ) -> Result<()>;
    async fn delete_record(&self, id: &RecordId) -> Result<()>;
}

/// One write in a batch handed to [Backend::commit]
#[derive(Clone, Debug, PartialEq)]
pub enum Write {
    AddAccount(ComputilityAccount),
    UpdateAccount {
        prior: ComputilityAccount,
        updated: ComputilityAccount,
    },
    CancelAccount(AccountIndex),
    AddDetail(ComputilityDetail),
    DeleteDetail(DetailId),
    UpdateOrg {
        prior: ComputilityOrg,
        updated: ComputilityOrg,
    },
    DeleteOrg(OrgId),
    AddRecord(ComputilityAccountRecord),
    UpdateRecord {
        prior: ComputilityAccountRecord,
        updated: ComputilityAccountRecord,
    },
    DeleteRecord(RecordId),
}

/// The computility storage backend
#[async_trait]
pub trait Backend: AccountStore + DetailStore + OrgStore + RecordStore + Send + Sync {
    /// Apply `writes` in order
    ///
    /// The default implementation offers no atomicity: should a write fail, those before it stand.
    async fn commit(&self, writes: &[Write]) -> Result<()> {
        for write in writes {
            match write {
                Write::AddAccount(account) => self.add_account(account).await?,
                Write::UpdateAccount { prior, updated } => {
                    self.update_account(prior, updated).await?
                }
                Write::CancelAccount(index) => {
                    self.cancel_account(index).await?;
                }
                Write::AddDetail(detail) => self.add_detail(detail).await?,
                Write::DeleteDetail(id) => self.delete_detail(id).await?,
                Write::UpdateOrg { prior, updated } => self.update_org(prior, updated).await?,
                Write::DeleteOrg(id) => self.delete_org(id).await?,
                Write::AddRecord(record) => self.add_record(record).await?,
                Write::UpdateRecord { prior, updated } => {
                    self.update_record(prior, updated).await?
                }
                Write::DeleteRecord(id) => self.delete_record(id).await?,
            }
        }
        Ok(())
    }
}
