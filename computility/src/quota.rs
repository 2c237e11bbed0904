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

//! # quota
//!
//! The computility application service: the operations that move quota between orgs, their
//! members & the members' spaces.
//!
//! # Introduction
//!
//! Orgs hand out quota to their members: when a user joins a compute-enabled org, they're assigned
//! the org's `default_assign_quota`, which is added to their [ComputilityAccount] & recorded in a
//! [ComputilityDetail]. Users consume & release that quota as their spaces start & stop. When a
//! user leaves (or the org goes away), the assignment is taken back; if the user is using more
//! than their remaining balance would cover, the shortfall is their "debt" & we publish a recall
//! event so that downstream can stop spaces until the books balance.
//!
//! Each operation reads what it needs, computes the new rows & hands the resulting writes to
//! [Backend::commit] as a single batch. Every row update is a compare-and-swap on the row's
//! version; a lost race surfaces as a storage conflict (a 500 to the caller) & is never retried
//! here.
//!
//! [Backend::commit]: crate::storage::Backend::commit

use std::sync::Arc;

use axum::http::StatusCode;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    background_tasks::{Context, Sender},
    counter_add,
    entities::{
        self, Account, AccountIndex, ComputeType, ComputilityAccount, ComputilityAccountRecord,
        ComputilityDetail, ComputilityOrg, DetailIndex, RecordIndex, SpaceId, check_amount,
    },
    metrics::{self, Instruments, Sort},
    recall::{PublishRecall, RecallInfo},
    storage::{self, Backend as StorageBackend, Write},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Default assignment quotas may not be negative; got {amount}"))]
    BadDefaultQuota { amount: i64, backtrace: Backtrace },
    #[snafu(display("{source}"))]
    Entity { source: entities::Error },
    #[snafu(display("User {user_name} has no {compute_type} account"))]
    NoAccount {
        user_name: Account,
        compute_type: ComputeType,
        backtrace: Backtrace,
    },
    #[snafu(display("User {user_name} has no quota assigned by {org_name}"))]
    NoDetail {
        org_name: Account,
        user_name: Account,
        backtrace: Backtrace,
    },
    #[snafu(display("User {user_name} has no {compute_type} permission"))]
    NoNpuPermission {
        user_name: Account,
        compute_type: ComputeType,
        backtrace: Backtrace,
    },
    #[snafu(display("Org {org_name} already exists"))]
    OrgExists {
        org_name: Account,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: storage::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable error codes, as returned in the `code` field of error responses
pub mod codes {
    pub const BAD_REQUEST_PARAM: &str = "bad_request_param";
    pub const INSUFFICIENT_QUOTA: &str = "insufficient_quota";
    pub const NO_NPU_PERMISSION: &str = "no_npu_permission";
    pub const NO_USED_QUOTA: &str = "no_used_quota";
    pub const NOT_FOUND: &str = "not_found";
    pub const ORG_EXISTS: &str = "org_exists";
    pub const RELEASE_EXCEEDS_USAGE: &str = "release_exceeds_usage";
    pub const SYSTEM_ERROR: &str = "system_error";
    pub const UNAUTHORIZED: &str = "unauthorized";
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, &'static str, String) {
        use codes::*;
        match self {
            Error::BadDefaultQuota { .. } => {
                (StatusCode::BAD_REQUEST, BAD_REQUEST_PARAM, self.to_string())
            }
            Error::Entity { source } => match source {
                entities::Error::InsufficientQuota { .. } => {
                    (StatusCode::BAD_REQUEST, INSUFFICIENT_QUOTA, source.to_string())
                }
                entities::Error::NoUsedQuota { .. } => {
                    (StatusCode::BAD_REQUEST, NO_USED_QUOTA, source.to_string())
                }
                entities::Error::ReleaseExceedsUsage { .. } => (
                    StatusCode::BAD_REQUEST,
                    RELEASE_EXCEEDS_USAGE,
                    source.to_string(),
                ),
                _ => (StatusCode::BAD_REQUEST, BAD_REQUEST_PARAM, source.to_string()),
            },
            Error::NoAccount { .. } | Error::NoDetail { .. } => {
                (StatusCode::NOT_FOUND, NOT_FOUND, self.to_string())
            }
            Error::NoNpuPermission { .. } => {
                (StatusCode::BAD_REQUEST, NO_NPU_PERMISSION, self.to_string())
            }
            Error::OrgExists { .. } => (StatusCode::CONFLICT, ORG_EXISTS, self.to_string()),
            // Don't leak backend details to callers; the log has them.
            Error::Storage { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                SYSTEM_ERROR,
                "Internal server error".to_owned(),
            ),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         response types                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One of a user's spaces & the quota it holds
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AccountRecord {
    pub user_name: Account,
    pub space_id: SpaceId,
    pub quota_count: i64,
    pub compute_type: ComputeType,
}

impl From<&ComputilityAccountRecord> for AccountRecord {
    fn from(value: &ComputilityAccountRecord) -> Self {
        AccountRecord {
            user_name: value.user_name.clone(),
            space_id: value.space_id.clone(),
            quota_count: value.quota_count,
            compute_type: value.compute_type,
        }
    }
}

/// What became of a departing member
///
/// `records` names the spaces holding the user's quota; callers should stop enough of them to
/// cover `quota_debt`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct QuotaRecall {
    pub user_name: Account,
    pub records: Vec<AccountRecord>,
    pub quota_debt: i64,
}

/// A user's view of their account
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AccountQuotaDetail {
    pub user_name: Account,
    pub used_quota: i64,
    pub total_quota: i64,
    pub compute_type: ComputeType,
    pub quota_balance: i64,
}

impl From<&ComputilityAccount> for AccountQuotaDetail {
    fn from(value: &ComputilityAccount) -> Self {
        AccountQuotaDetail {
            user_name: value.user_name.clone(),
            used_quota: value.used_quota,
            total_quota: value.quota_count,
            compute_type: value.compute_type,
            quota_balance: value.balance(),
        }
    }
}

/// Request to provision a compute-enabled org
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewOrg {
    pub org_name: Account,
    /// The org's identifier in the hosting platform; one is minted if not given
    pub org_id: Option<Uuid>,
    pub compute_type: ComputeType,
    pub default_assign_quota: i64,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          QuotaService                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("quota.joins", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("quota.removals", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("quota.orgs.created", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("quota.orgs.deleted", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("quota.consumed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("quota.released", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("quota.recalls.enqueued", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("quota.recalls.enqueue_failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("quota.conflicts", Sort::IntegralCounter) }

/// The computility application service
pub struct QuotaService {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    recalls: Arc<dyn Sender<Context, PublishRecall> + Send + Sync>,
    instruments: Arc<Instruments>,
}

impl QuotaService {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        recalls: Arc<dyn Sender<Context, PublishRecall> + Send + Sync>,
        instruments: Arc<Instruments>,
    ) -> QuotaService {
        QuotaService {
            storage,
            recalls,
            instruments,
        }
    }

    async fn commit(&self, writes: &[Write]) -> Result<()> {
        let result = self.storage.commit(writes).await;
        if matches!(&result, Err(err) if err.is_conflict()) {
            counter_add!(self.instruments, "quota.conflicts", 1, &[]);
        }
        result.context(StorageSnafu)
    }

    /// Provision a compute-enabled org
    pub async fn create_org(&self, req: &NewOrg) -> Result<ComputilityOrg> {
        ensure!(
            req.default_assign_quota >= 0,
            BadDefaultQuotaSnafu {
                amount: req.default_assign_quota
            }
        );
        let org = ComputilityOrg::new(
            req.org_id.unwrap_or_else(Uuid::new_v4),
            &req.org_name,
            req.compute_type,
            req.default_assign_quota,
        );
        match self.storage.add_org(&org).await {
            Ok(_) => {
                info!(org = %org.org_name, compute_type = %org.compute_type, "Provisioned org");
                counter_add!(self.instruments, "quota.orgs.created", 1, &[]);
                Ok(org)
            }
            Err(storage::Error::Duplicate { .. }) => OrgExistsSnafu {
                org_name: req.org_name.clone(),
            }
            .fail(),
            Err(err) => Err(err).context(StorageSnafu),
        }
    }

    /// `user_name` has joined `org_name`; assign them the org's default quota
    ///
    /// A no-op if the org isn't compute-enabled. Joining twice assigns twice.
    pub async fn user_join(&self, org_name: &Account, user_name: &Account) -> Result<()> {
        let Some(org) = self.storage.org(org_name).await.context(StorageSnafu)? else {
            debug!("{org_name} is not compute-enabled; nothing to do for {user_name}");
            return Ok(());
        };
        let amount = org.default_assign_quota;
        let index = AccountIndex {
            user_name: user_name.clone(),
            compute_type: org.compute_type,
        };

        let mut writes = Vec::with_capacity(3);
        match self.storage.account(&index).await.context(StorageSnafu)? {
            Some(account) => writes.push(Write::UpdateAccount {
                updated: account.assigned(amount).context(EntitySnafu)?,
                prior: account,
            }),
            None => writes.push(Write::AddAccount(
                ComputilityAccount::new(user_name, org.compute_type)
                    .assigned(amount)
                    .context(EntitySnafu)?,
            )),
        }
        writes.push(Write::AddDetail(ComputilityDetail::new(
            org_name,
            user_name,
            org.compute_type,
            amount,
        )));
        writes.push(Write::UpdateOrg {
            updated: org.assigned(amount).context(EntitySnafu)?,
            prior: org,
        });
        self.commit(&writes).await?;

        info!(org = %org_name, user = %user_name, amount, "Assigned quota");
        counter_add!(self.instruments, "quota.joins", 1, &[]);
        Ok(())
    }

    /// `user_name` has left `org_name`; take back what the org assigned them
    ///
    /// A no-op if the org isn't compute-enabled; an error if the user has no account.
    pub async fn user_remove(
        &self,
        org_name: &Account,
        user_name: &Account,
    ) -> Result<Option<QuotaRecall>> {
        let Some(org) = self.storage.org(org_name).await.context(StorageSnafu)? else {
            debug!("{org_name} is not compute-enabled; nothing to do for {user_name}");
            return Ok(None);
        };
        let index = AccountIndex {
            user_name: user_name.clone(),
            compute_type: org.compute_type,
        };
        if self
            .storage
            .account(&index)
            .await
            .context(StorageSnafu)?
            .is_none()
        {
            error!("User {user_name} has no {} account", org.compute_type);
            return NoAccountSnafu {
                user_name: user_name.clone(),
                compute_type: org.compute_type,
            }
            .fail();
        }
        self.remove_member(org_name, user_name).await.map(Some)
    }

    /// Take back the oldest assignment `org_name` made to `user_name`
    async fn remove_member(&self, org_name: &Account, user_name: &Account) -> Result<QuotaRecall> {
        let detail = self
            .storage
            .detail(&DetailIndex {
                org_name: org_name.clone(),
                user_name: user_name.clone(),
            })
            .await
            .context(StorageSnafu)?
            .context(NoDetailSnafu {
                org_name: org_name.clone(),
                user_name: user_name.clone(),
            })?;
        let assigned = detail.quota_count;
        let index = AccountIndex {
            user_name: user_name.clone(),
            compute_type: detail.compute_type,
        };
        let account = self
            .storage
            .account(&index)
            .await
            .context(StorageSnafu)?
            .context(NoAccountSnafu {
                user_name: user_name.clone(),
                compute_type: detail.compute_type,
            })?;
        // Re-read the org each time; when deleting an org, each removal bumps its version.
        let org = self
            .storage
            .org(org_name)
            .await
            .context(StorageSnafu)?
            .context(NoDetailSnafu {
                org_name: org_name.clone(),
                user_name: user_name.clone(),
            })?;
        let debt = account.debt(assigned);
        // The spaces only matter to the caller if some of them must be stopped
        let records = if debt > 0 {
            self.storage.records(&index).await.context(StorageSnafu)?
        } else {
            Vec::new()
        };
        let updated = account.recalled(assigned);
        let cancel = updated.is_cancellable();
        let mut writes = vec![
            Write::UpdateAccount {
                prior: account,
                updated,
            },
            Write::UpdateOrg {
                updated: org.recalled(assigned),
                prior: org,
            },
            Write::DeleteDetail(detail.id),
        ];
        if cancel {
            writes.push(Write::CancelAccount(index));
        }
        self.commit(&writes).await?;
        info!(org = %org_name, user = %user_name, assigned, debt, "Recalled quota");
        counter_add!(self.instruments, "quota.removals", 1, &[]);

        if debt > 0 {
            self.enqueue_recall(RecallInfo {
                user_name: user_name.clone(),
                quota_count: debt,
                compute_type: detail.compute_type,
            })
            .await;
        }

        Ok(QuotaRecall {
            user_name: user_name.clone(),
            records: records.iter().map(AccountRecord::from).collect(),
            quota_debt: debt,
        })
    }

    // The removal has already been committed; failing to schedule the event is logged, not
    // returned.
    async fn enqueue_recall(&self, recall: RecallInfo) {
        let user_name = recall.user_name.clone();
        let debt = recall.quota_count;
        match self.recalls.send(PublishRecall::new(recall)).await {
            Ok(_) => {
                debug!("Scheduled a recall of {debt} from {user_name}");
                counter_add!(self.instruments, "quota.recalls.enqueued", 1, &[]);
            }
            Err(err) => {
                error!("Failed to schedule a recall of {debt} from {user_name}: {err:?}");
                counter_add!(self.instruments, "quota.recalls.enqueue_failures", 1, &[]);
            }
        }
    }

    /// `org_name` is going away; remove each member, then the org itself
    ///
    /// Members whose removal fails are logged & skipped.
    pub async fn org_delete(&self, org_name: &Account) -> Result<Vec<QuotaRecall>> {
        let Some(org) = self.storage.org(org_name).await.context(StorageSnafu)? else {
            debug!("{org_name} is not compute-enabled; nothing to delete");
            return Ok(Vec::new());
        };
        let members = self
            .storage
            .org_members(org_name)
            .await
            .context(StorageSnafu)?;

        let mut recalls = Vec::with_capacity(members.len());
        for member in &members {
            match self.remove_member(org_name, &member.user_name).await {
                Ok(recall) => recalls.push(recall),
                Err(err) => {
                    error!(
                        "While deleting {org_name}, failed to remove {}: {err:?}",
                        member.user_name
                    );
                }
            }
        }

        self.commit(&[Write::DeleteOrg(org.id)]).await?;
        info!(org = %org_name, members = members.len(), "Deleted org");
        counter_add!(self.instruments, "quota.orgs.deleted", 1, &[]);
        Ok(recalls)
    }

    /// `user_name` would like to consume `amount` of their `compute_type` quota, optionally on
    /// behalf of `space_id`
    ///
    /// If `space_id` is already consuming, this is a no-op.
    pub async fn user_quota_consume(
        &self,
        user_name: &Account,
        compute_type: ComputeType,
        amount: i64,
        space_id: Option<&SpaceId>,
    ) -> Result<()> {
        let amount = check_amount(amount).context(EntitySnafu)?;
        if compute_type.is_cpu() {
            return Ok(());
        }
        let index = AccountIndex {
            user_name: user_name.clone(),
            compute_type,
        };
        let account = self
            .storage
            .account(&index)
            .await
            .context(StorageSnafu)?
            .context(NoNpuPermissionSnafu {
                user_name: user_name.clone(),
                compute_type,
            })?;

        let mut writes = Vec::with_capacity(2);
        if let Some(space_id) = space_id {
            let rindex = RecordIndex {
                user_name: user_name.clone(),
                space_id: space_id.clone(),
                compute_type,
            };
            if self
                .storage
                .record(&rindex)
                .await
                .context(StorageSnafu)?
                .is_some()
            {
                info!("Space {space_id} is already consuming {user_name}'s quota");
                return Ok(());
            }
            writes.push(Write::AddRecord(ComputilityAccountRecord::new(
                &rindex, amount,
            )));
        }
        let updated = account.consumed(amount).context(EntitySnafu)?;
        writes.insert(
            0,
            Write::UpdateAccount {
                prior: account,
                updated,
            },
        );
        self.commit(&writes).await?;

        debug!(user = %user_name, amount, "Consumed quota");
        counter_add!(
            self.instruments,
            "quota.consumed",
            amount as u64,
            &[KeyValue::new("compute_type", compute_type.as_str())]
        );
        Ok(())
    }

    /// `user_name` is done with `amount` of their `compute_type` quota, optionally on behalf of
    /// `space_id`
    ///
    /// Releasing against a user with no account succeeds (after logging), as does releasing on
    /// behalf of a space that isn't consuming anything. A space's record is always deleted; if a
    /// recall has since written usage down, only what's left in use is released.
    pub async fn user_quota_release(
        &self,
        user_name: &Account,
        compute_type: ComputeType,
        amount: i64,
        space_id: Option<&SpaceId>,
    ) -> Result<()> {
        let amount = check_amount(amount).context(EntitySnafu)?;
        if compute_type.is_cpu() {
            return Ok(());
        }
        let index = AccountIndex {
            user_name: user_name.clone(),
            compute_type,
        };

        let mut writes = Vec::with_capacity(3);
        if let Some(space_id) = space_id {
            let rindex = RecordIndex {
                user_name: user_name.clone(),
                space_id: space_id.clone(),
                compute_type,
            };
            match self.storage.record(&rindex).await.context(StorageSnafu)? {
                Some(record) => writes.push(Write::DeleteRecord(record.id)),
                None => {
                    info!("Space {space_id} has no consumption of {user_name}'s quota to release");
                    return Ok(());
                }
            }
        }
        let for_space = !writes.is_empty();

        let Some(account) = self.storage.account(&index).await.context(StorageSnafu)? else {
            warn!("User {user_name} has no {compute_type} account; nothing to release");
            if for_space {
                self.commit(&writes).await?;
            }
            return Ok(());
        };
        // A recall may have written usage down below what the space recorded
        let amount = if for_space {
            amount.min(account.used_quota)
        } else {
            amount
        };
        if amount == 0 {
            debug!("{user_name}'s usage was already recalled; dropping the space's record");
            self.commit(&writes).await?;
            return Ok(());
        }
        let updated = account.released(amount).context(EntitySnafu)?;
        let cancel = updated.is_cancellable();
        writes.insert(
            0,
            Write::UpdateAccount {
                prior: account,
                updated,
            },
        );
        if cancel {
            writes.push(Write::CancelAccount(index));
        }
        self.commit(&writes).await?;

        debug!(user = %user_name, amount, "Released quota");
        counter_add!(
            self.instruments,
            "quota.released",
            amount as u64,
            &[KeyValue::new("compute_type", compute_type.as_str())]
        );
        Ok(())
    }

    /// `space_id` has been re-created as `new_space_id`; move its consumption along with it
    pub async fn space_create_supply(
        &self,
        user_name: &Account,
        compute_type: ComputeType,
        space_id: &SpaceId,
        new_space_id: &SpaceId,
    ) -> Result<()> {
        if compute_type.is_cpu() {
            return Ok(());
        }
        self.storage
            .account(&AccountIndex {
                user_name: user_name.clone(),
                compute_type,
            })
            .await
            .context(StorageSnafu)?
            .context(NoNpuPermissionSnafu {
                user_name: user_name.clone(),
                compute_type,
            })?;
        let index = RecordIndex {
            user_name: user_name.clone(),
            space_id: space_id.clone(),
            compute_type,
        };
        let Some(record) = self.storage.record(&index).await.context(StorageSnafu)? else {
            info!("Space {space_id} holds none of {user_name}'s quota; nothing to move");
            return Ok(());
        };
        self.commit(&[Write::UpdateRecord {
            updated: record.rebound(new_space_id),
            prior: record,
        }])
        .await?;
        debug!("Moved {user_name}'s consumption from {space_id} to {new_space_id}");
        Ok(())
    }

    /// Look up `user_name`'s `compute_type` account
    pub async fn account_detail(
        &self,
        user_name: &Account,
        compute_type: ComputeType,
    ) -> Result<AccountQuotaDetail> {
        self.storage
            .account(&AccountIndex {
                user_name: user_name.clone(),
                compute_type,
            })
            .await
            .context(StorageSnafu)?
            .as_ref()
            .map(AccountQuotaDetail::from)
            .context(NoAccountSnafu {
                user_name: user_name.clone(),
                compute_type,
            })
    }
}
