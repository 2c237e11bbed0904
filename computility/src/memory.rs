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

//! # memory
//!
//! [Storage] implementation that keeps everything in process memory. Nothing survives a restart;
//! this is for tests & for kicking the tires.
//!
//! [Storage]: crate::storage
//!
//! [Backend::commit] applies a batch to a copy of the tables & swaps the copy in only if every
//! write succeeded, all under one lock, so batches are atomic.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use uuid::Uuid;

use crate::{
    background_tasks::{self, FlatTask, LeasedTask},
    entities::{
        Account, AccountId, AccountIndex, ComputilityAccount, ComputilityAccountRecord,
        ComputilityDetail, ComputilityOrg, DetailId, DetailIndex, OrgId, RecordId, RecordIndex,
    },
    storage::{
        AccountStore, Backend, ConcurrentUpdateSnafu, DetailStore, DuplicateSnafu, OrgStore,
        RecordStore, Result, Write,
    },
};

#[derive(Clone, Debug, Default)]
struct Tables {
    accounts: HashMap<AccountId, ComputilityAccount>,
    details: HashMap<DetailId, ComputilityDetail>,
    orgs: HashMap<OrgId, ComputilityOrg>,
    records: HashMap<RecordId, ComputilityAccountRecord>,
}

impl Tables {
    fn account(&self, index: &AccountIndex) -> Option<&ComputilityAccount> {
        self.accounts.values().find(|a| a.index() == *index)
    }
    fn add_account(&mut self, account: &ComputilityAccount) -> Result<()> {
        if self.account(&account.index()).is_some() {
            return DuplicateSnafu {
                entity: "account",
                key: format!("{}/{}", account.user_name, account.compute_type),
            }
            .fail();
        }
        self.accounts.insert(account.id, account.clone());
        Ok(())
    }
    fn update_account(
        &mut self,
        prior: &ComputilityAccount,
        updated: &ComputilityAccount,
    ) -> Result<()> {
        match self.accounts.get_mut(&prior.id) {
            Some(current) if current.version == prior.version => {
                *current = updated.clone();
                Ok(())
            }
            _ => ConcurrentUpdateSnafu { entity: "account" }.fail(),
        }
    }
    fn cancel_account(&mut self, index: &AccountIndex) -> bool {
        let id = self
            .account(index)
            .filter(|a| a.is_cancellable())
            .map(|a| a.id);
        id.and_then(|id| self.accounts.remove(&id)).is_some()
    }
    fn details_for<'a>(
        &'a self,
        pred: impl Fn(&ComputilityDetail) -> bool + 'a,
    ) -> impl Iterator<Item = &'a ComputilityDetail> + 'a {
        self.details
            .values()
            .filter(move |d| pred(d))
            .sorted_by(|l, r| l.created_at.cmp(&r.created_at).then(l.id.cmp(&r.id)))
    }
    fn add_detail(&mut self, detail: &ComputilityDetail) -> Result<()> {
        if self.details.contains_key(&detail.id) {
            return DuplicateSnafu {
                entity: "detail",
                key: detail.id.to_string(),
            }
            .fail();
        }
        self.details.insert(detail.id, detail.clone());
        Ok(())
    }
    fn delete_detail(&mut self, id: &DetailId) -> Result<()> {
        self.details
            .remove(id)
            .map(|_| ())
            .ok_or(ConcurrentUpdateSnafu { entity: "detail" }.build())
    }
    fn org(&self, org_name: &Account) -> Option<&ComputilityOrg> {
        self.orgs.values().find(|o| o.org_name == *org_name)
    }
    fn add_org(&mut self, org: &ComputilityOrg) -> Result<()> {
        if self.org(&org.org_name).is_some() {
            return DuplicateSnafu {
                entity: "org",
                key: org.org_name.to_string(),
            }
            .fail();
        }
        self.orgs.insert(org.id, org.clone());
        Ok(())
    }
    fn update_org(&mut self, prior: &ComputilityOrg, updated: &ComputilityOrg) -> Result<()> {
        match self.orgs.get_mut(&prior.id) {
            Some(current) if current.version == prior.version => {
                *current = updated.clone();
                Ok(())
            }
            _ => ConcurrentUpdateSnafu { entity: "org" }.fail(),
        }
    }
    fn delete_org(&mut self, id: &OrgId) -> Result<()> {
        self.orgs
            .remove(id)
            .map(|_| ())
            .ok_or(ConcurrentUpdateSnafu { entity: "org" }.build())
    }
    fn record(&self, index: &RecordIndex) -> Option<&ComputilityAccountRecord> {
        self.records.values().find(|r| {
            r.user_name == index.user_name
                && r.space_id == index.space_id
                && r.compute_type == index.compute_type
        })
    }
    fn add_record(&mut self, record: &ComputilityAccountRecord) -> Result<()> {
        let index = RecordIndex {
            user_name: record.user_name.clone(),
            space_id: record.space_id.clone(),
            compute_type: record.compute_type,
        };
        if self.record(&index).is_some() {
            return DuplicateSnafu {
                entity: "account record",
                key: format!("{}/{}", record.user_name, record.space_id),
            }
            .fail();
        }
        self.records.insert(record.id, record.clone());
        Ok(())
    }
    fn update_record(
        &mut self,
        prior: &ComputilityAccountRecord,
        updated: &ComputilityAccountRecord,
    ) -> Result<()> {
        match self.records.get_mut(&prior.id) {
            Some(current) if current.version == prior.version => {
                *current = updated.clone();
                Ok(())
            }
            _ => ConcurrentUpdateSnafu {
                entity: "account record",
            }
            .fail(),
        }
    }
    fn delete_record(&mut self, id: &RecordId) -> Result<()> {
        self.records.remove(id).map(|_| ()).ok_or(
            ConcurrentUpdateSnafu {
                entity: "account record",
            }
            .build(),
        )
    }
    fn apply(&mut self, write: &Write) -> Result<()> {
        match write {
            Write::AddAccount(account) => self.add_account(account),
            Write::UpdateAccount { prior, updated } => self.update_account(prior, updated),
            Write::CancelAccount(index) => {
                self.cancel_account(index);
                Ok(())
            }
            Write::AddDetail(detail) => self.add_detail(detail),
            Write::DeleteDetail(id) => self.delete_detail(id),
            Write::UpdateOrg { prior, updated } => self.update_org(prior, updated),
            Write::DeleteOrg(id) => self.delete_org(id),
            Write::AddRecord(record) => self.add_record(record),
            Write::UpdateRecord { prior, updated } => self.update_record(prior, updated),
            Write::DeleteRecord(id) => self.delete_record(id),
        }
    }
}

/// In-memory storage backend
#[derive(Debug, Default)]
pub struct Memory {
    tables: Mutex<Tables>,
    tasks: Mutex<Vec<FlatTask>>,
}

// No code path panics while holding either lock, but be robust to it anyway.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Memory {
    pub fn new() -> Memory {
        Memory::default()
    }
    /// Start out with `orgs` already provisioned
    pub fn with_orgs(orgs: impl IntoIterator<Item = ComputilityOrg>) -> Memory {
        let memory = Memory::new();
        {
            let mut tables = lock(&memory.tables);
            orgs.into_iter().for_each(|org| {
                tables.orgs.insert(org.id, org);
            });
        }
        memory
    }
}

#[async_trait]
impl AccountStore for Memory {
    async fn add_account(&self, account: &ComputilityAccount) -> Result<()> {
        lock(&self.tables).add_account(account)
    }
    async fn account(&self, index: &AccountIndex) -> Result<Option<ComputilityAccount>> {
        Ok(lock(&self.tables).account(index).cloned())
    }
    async fn update_account(
        &self,
        prior: &ComputilityAccount,
        updated: &ComputilityAccount,
    ) -> Result<()> {
        lock(&self.tables).update_account(prior, updated)
    }
    async fn cancel_account(&self, index: &AccountIndex) -> Result<bool> {
        Ok(lock(&self.tables).cancel_account(index))
    }
}

#[async_trait]
impl DetailStore for Memory {
    async fn add_detail(&self, detail: &ComputilityDetail) -> Result<()> {
        lock(&self.tables).add_detail(detail)
    }
    async fn detail(&self, index: &DetailIndex) -> Result<Option<ComputilityDetail>> {
        Ok(lock(&self.tables)
            .details_for(|d| d.index() == *index)
            .next()
            .cloned())
    }
    async fn org_members(&self, org_name: &Account) -> Result<Vec<ComputilityDetail>> {
        Ok(lock(&self.tables)
            .details_for(|d| d.org_name == *org_name)
            .cloned()
            .collect())
    }
    async fn delete_detail(&self, id: &DetailId) -> Result<()> {
        lock(&self.tables).delete_detail(id)
    }
}

#[async_trait]
impl OrgStore for Memory {
    async fn add_org(&self, org: &ComputilityOrg) -> Result<()> {
        lock(&self.tables).add_org(org)
    }
    async fn org(&self, org_name: &Account) -> Result<Option<ComputilityOrg>> {
        Ok(lock(&self.tables).org(org_name).cloned())
    }
    async fn update_org(&self, prior: &ComputilityOrg, updated: &ComputilityOrg) -> Result<()> {
        lock(&self.tables).update_org(prior, updated)
    }
    async fn delete_org(&self, id: &OrgId) -> Result<()> {
        lock(&self.tables).delete_org(id)
    }
}

#[async_trait]
impl RecordStore for Memory {
    async fn add_record(&self, record: &ComputilityAccountRecord) -> Result<()> {
        lock(&self.tables).add_record(record)
    }
    async fn record(&self, index: &RecordIndex) -> Result<Option<ComputilityAccountRecord>> {
        Ok(lock(&self.tables).record(index).cloned())
    }
    async fn records(&self, index: &AccountIndex) -> Result<Vec<ComputilityAccountRecord>> {
        Ok(lock(&self.tables)
            .records
            .values()
            .filter(|r| r.user_name == index.user_name && r.compute_type == index.compute_type)
            .sorted_by_key(|r| r.created_at)
            .cloned()
            .collect())
    }
    async fn update_record(
        &self,
        prior: &ComputilityAccountRecord,
        updated: &ComputilityAccountRecord,
    ) -> Result<()> {
        lock(&self.tables).update_record(prior, updated)
    }
    async fn delete_record(&self, id: &RecordId) -> Result<()> {
        lock(&self.tables).delete_record(id)
    }
}

#[async_trait]
impl Backend for Memory {
    async fn commit(&self, writes: &[Write]) -> Result<()> {
        let mut tables = lock(&self.tables);
        let mut scratch = tables.clone();
        writes.iter().try_for_each(|write| scratch.apply(write))?;
        *tables = scratch;
        Ok(())
    }
}

#[async_trait]
impl background_tasks::Backend for Memory {
    async fn write_task(&self, tag: &Uuid, buf: &[u8]) -> background_tasks::Result<()> {
        lock(&self.tasks).push(FlatTask::new(tag, buf));
        Ok(())
    }
    async fn lease_task(&self, lease: Duration) -> background_tasks::Result<Option<LeasedTask>> {
        let now = Utc::now();
        let mut tasks = lock(&self.tasks);
        Ok(tasks
            .iter_mut()
            .filter(|t| t.is_available(&now))
            .min_by_key(|t| t.created)
            .map(|t| {
                t.lease_expires = FlatTask::lease_expiry(now, lease);
                t.attempts += 1;
                LeasedTask {
                    tag: t.tag,
                    id: t.id,
                    buf: t.task.clone(),
                    attempts: t.attempts,
                }
            }))
    }
    async fn close_task(&self, uuid: &Uuid) -> background_tasks::Result<()> {
        if let Some(t) = lock(&self.tasks).iter_mut().find(|t| t.id == *uuid) {
            t.done = true;
        }
        Ok(())
    }
    async fn fail_task(
        &self,
        uuid: &Uuid,
        retry_at: Option<DateTime<Utc>>,
    ) -> background_tasks::Result<()> {
        if let Some(t) = lock(&self.tasks).iter_mut().find(|t| t.id == *uuid) {
            match retry_at {
                Some(retry_at) => t.lease_expires = retry_at,
                None => t.dead = true,
            }
        }
        Ok(())
    }
    async fn dead_letters(&self) -> background_tasks::Result<Vec<FlatTask>> {
        Ok(lock(&self.tasks).iter().filter(|t| t.dead).cloned().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{entities::ComputeType, storage::Error as StorError};

    fn alice() -> Account {
        Account::new("alice").unwrap()
    }

    #[tokio::test]
    async fn compare_and_swap() {
        let memory = Memory::new();
        let account = ComputilityAccount::new(&alice(), ComputeType::Npu);
        memory.add_account(&account).await.unwrap();
        let first = account.assigned(3).unwrap();
        memory.update_account(&account, &first).await.unwrap();
        // Writing against the stale version loses
        let second = account.assigned(5).unwrap();
        assert!(matches!(
            memory.update_account(&account, &second).await,
            Err(StorError::ConcurrentUpdate { .. })
        ));
        let stored = memory.account(&account.index()).await.unwrap().unwrap();
        assert_eq!((stored.quota_count, stored.version), (3, 1));
        assert!(matches!(
            memory.add_account(&account).await,
            Err(StorError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn batches_are_atomic() {
        let org = ComputilityOrg::new(Uuid::new_v4(), &Account::new("acme-corp").unwrap(), ComputeType::Npu, 3);
        let memory = Memory::with_orgs([org.clone()]);
        let account = ComputilityAccount::new(&alice(), ComputeType::Npu);
        let detail = ComputilityDetail::new(&org.org_name, &alice(), ComputeType::Npu, 3);
        // The org update is against a stale version, so nothing should land
        let stale = ComputilityOrg {
            version: 7,
            ..org.clone()
        };
        let result = memory
            .commit(&[
                Write::AddAccount(account.clone()),
                Write::AddDetail(detail.clone()),
                Write::UpdateOrg {
                    prior: stale.clone(),
                    updated: stale.assigned(3).unwrap(),
                },
            ])
            .await;
        assert!(result.unwrap_err().is_conflict());
        assert!(memory.account(&account.index()).await.unwrap().is_none());
        assert!(memory.detail(&detail.index()).await.unwrap().is_none());

        memory
            .commit(&[
                Write::AddAccount(account.clone()),
                Write::AddDetail(detail.clone()),
                Write::UpdateOrg {
                    prior: org.clone(),
                    updated: org.assigned(3).unwrap(),
                },
            ])
            .await
            .unwrap();
        assert!(memory.account(&account.index()).await.unwrap().is_some());
        assert_eq!(
            memory.org(&org.org_name).await.unwrap().unwrap().quota_count,
            3
        );
    }

    #[tokio::test]
    async fn cancel_only_empty_accounts() {
        let memory = Memory::new();
        let account = ComputilityAccount::new(&alice(), ComputeType::Npu);
        memory.add_account(&account).await.unwrap();
        let assigned = account.assigned(1).unwrap();
        memory.update_account(&account, &assigned).await.unwrap();
        assert!(!memory.cancel_account(&account.index()).await.unwrap());
        let recalled = assigned.recalled(1);
        memory.update_account(&assigned, &recalled).await.unwrap();
        assert!(memory.cancel_account(&account.index()).await.unwrap());
        assert!(memory.account(&account.index()).await.unwrap().is_none());
    }
}
