// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
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

//! # scylla
//!
//! [Storage] implementation for ScyllaDB.
//!
//! [Storage]: crate::storage
//!
//! Every versioned write is a lightweight transaction (`... IF version = ?`); the `[applied]`
//! column of the result tells us whether we won. ScyllaDB has no multi-partition transactions, so
//! this backend keeps the default [Backend::commit]: a batch is applied row by row & a failure
//! part way through leaves the earlier writes in place.
//!
//! Tables are keyed so that the lookups the application makes are partition reads:
//!
//! - accounts by `(user_name, compute_type)`
//! - orgs by `org_name`
//! - details by `org_name`, clustered oldest first
//! - account records by `(user_name, compute_type)`, clustered by `space_id`
//!
//! Deletes by id go through secondary indices on `id`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enum_map::{Enum, EnumMap};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use scylla::{
    client::{session::Session as ScyllaSession, session_builder::SessionBuilder},
    response::query_result::QueryResult,
    statement::prepared::PreparedStatement,
    value::{CqlValue, Row},
};
use secrecy::{ExposeSecret, SecretString};
use snafu::{Backtrace, prelude::*};
use tap::Pipe;
use tracing::info;
use uuid::Uuid;

use crate::{
    background_tasks::{self, FlatTask, LeasedTask},
    entities::{
        Account, AccountIndex, ComputeType, ComputilityAccount, ComputilityAccountRecord,
        ComputilityDetail, ComputilityOrg, DetailId, DetailIndex, OrgId, RecordId, RecordIndex,
        SpaceId,
    },
    storage::{
        self, AccountStore, Backend, ConcurrentUpdateSnafu, DetailStore, DuplicateSnafu, OrgStore,
        RecordStore,
    },
    util::Tables,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "The number of prepared statements isn't consistent; this is a bug & should be reported!"
    ))]
    BadPreparedStatementCount { backtrace: Backtrace },
    #[snafu(display("Failed to set keyspace {keyspace}: {source}"))]
    Keyspace {
        keyspace: String,
        source: scylla::errors::UseKeyspaceError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create a ScyllaDB session: {source}"))]
    NewSession {
        source: scylla::errors::NewSessionError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to prepare statement: {stmt}: {source}"))]
    Prepare {
        stmt: String,
        source: scylla::errors::PrepareError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create schema ({stmt}): {source}"))]
    Schema {
        stmt: String,
        source: scylla::errors::ExecutionError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

use storage::Error as StorError;

/// Use these when there's no context worth adding to a failed query
macro_rules! into_stor_error {
    ($($t:ty),*) => {
        $(
            impl std::convert::From<$t> for StorError {
                fn from(value: $t) -> Self {
                    StorError::new(value)
                }
            }
        )*
    };
}

into_stor_error!(
    scylla::errors::ExecutionError,
    scylla::errors::IntoRowsResultError,
    scylla::errors::MaybeFirstRowError,
    scylla::errors::RowsError,
    scylla::deserialize::DeserializationError
);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                               computility ScyllaDB session type                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

const ACCOUNT_COLS: &str = "id,user_name,compute_type,quota_count,used_quota,created_at,version";
const DETAIL_COLS: &str = "id,org_name,user_name,compute_type,quota_count,created_at,version";
const ORG_COLS: &str =
    "id,org_id,org_name,compute_type,quota_count,used_quota,default_assign_quota,version";
const RECORD_COLS: &str = "id,user_name,space_id,compute_type,quota_count,created_at,version";
const TASK_COLS: &str = "id,created,task,tag,lease_expires,attempts,done,dead";

/// The set of prepared statements used by computility
///
/// Used as both a mnemonic tag identifying prepared statements and as the key type in a mapping
/// from said tags to the actual [PreparedStatement]s.
#[derive(Clone, Copy, Debug, Enum, Eq, PartialEq)]
enum PreparedStatements {
    SelectAccount,
    InsertAccount,
    UpdateAccount,
    CancelAccount,
    SelectOrgMembers,
    SelectDetail,
    InsertDetail,
    SelectDetailKey,
    DeleteDetail,
    SelectOrg,
    InsertOrg,
    UpdateOrg,
    SelectOrgKey,
    DeleteOrg,
    SelectRecord,
    SelectRecords,
    InsertRecord,
    UpdateRecord,
    SelectRecordKey,
    DeleteRecord,
    InsertTask,
    SelectOpenTasks,
    LeaseTask,
    CloseTask,
    RetryTask,
    KillTask,
    SelectDeadTasks,
}

impl PreparedStatements {
    fn cql(self, t: &Tables) -> String {
        use PreparedStatements::*;
        match self {
            SelectAccount => format!(
                "select {ACCOUNT_COLS} from {} where user_name=? and compute_type=?",
                t.account
            ),
            InsertAccount => format!(
                "insert into {} ({ACCOUNT_COLS}) values (?,?,?,?,?,?,?) if not exists",
                t.account
            ),
            UpdateAccount => format!(
                "update {} set quota_count=?, used_quota=?, version=? where user_name=? and compute_type=? if version=?",
                t.account
            ),
            CancelAccount => format!(
                "delete from {} where user_name=? and compute_type=? if quota_count=0 and used_quota=0",
                t.account
            ),
            SelectOrgMembers => format!("select {DETAIL_COLS} from {} where org_name=?", t.detail),
            SelectDetail => format!(
                "select {DETAIL_COLS} from {} where org_name=? and user_name=? allow filtering",
                t.detail
            ),
            InsertDetail => format!(
                "insert into {} ({DETAIL_COLS}) values (?,?,?,?,?,?,?) if not exists",
                t.detail
            ),
            SelectDetailKey => format!("select org_name,created_at from {} where id=?", t.detail),
            DeleteDetail => format!(
                "delete from {} where org_name=? and created_at=? and id=? if exists",
                t.detail
            ),
            SelectOrg => format!("select {ORG_COLS} from {} where org_name=?", t.org),
            InsertOrg => format!(
                "insert into {} ({ORG_COLS}) values (?,?,?,?,?,?,?,?) if not exists",
                t.org
            ),
            UpdateOrg => format!(
                "update {} set quota_count=?, used_quota=?, default_assign_quota=?, version=? where org_name=? if version=?",
                t.org
            ),
            SelectOrgKey => format!("select org_name from {} where id=?", t.org),
            DeleteOrg => format!("delete from {} where org_name=? if id=?", t.org),
            SelectRecord => format!(
                "select {RECORD_COLS} from {} where user_name=? and compute_type=? and space_id=?",
                t.account_record
            ),
            SelectRecords => format!(
                "select {RECORD_COLS} from {} where user_name=? and compute_type=?",
                t.account_record
            ),
            InsertRecord => format!(
                "insert into {} ({RECORD_COLS}) values (?,?,?,?,?,?,?) if not exists",
                t.account_record
            ),
            UpdateRecord => format!(
                "update {} set quota_count=?, version=? where user_name=? and compute_type=? and space_id=? if version=?",
                t.account_record
            ),
            SelectRecordKey => format!(
                "select user_name,compute_type,space_id from {} where id=?",
                t.account_record
            ),
            DeleteRecord => format!(
                "delete from {} where user_name=? and compute_type=? and space_id=? if version=?",
                t.account_record
            ),
            InsertTask => format!(
                "insert into {} ({TASK_COLS}) values (?,?,?,?,?,?,?,?)",
                t.tasks
            ),
            SelectOpenTasks => format!(
                "select {TASK_COLS} from {} where done=false and dead=false allow filtering",
                t.tasks
            ),
            LeaseTask => format!(
                "update {} set lease_expires=?, attempts=? where id=? if lease_expires=? and attempts=?",
                t.tasks
            ),
            CloseTask => format!("update {} set done=true where id=?", t.tasks),
            RetryTask => format!("update {} set lease_expires=? where id=?", t.tasks),
            KillTask => format!("update {} set dead=true where id=?", t.tasks),
            SelectDeadTasks => format!(
                "select {TASK_COLS} from {} where dead=true allow filtering",
                t.tasks
            ),
        }
    }
}

/// The tables (& the secondary indices on them), in an order that respects dependencies
fn schema(t: &Tables) -> Vec<String> {
    vec![
        format!(
            "create table if not exists {} (id uuid, user_name text, compute_type text, quota_count bigint, used_quota bigint, created_at timestamp, version bigint, primary key ((user_name, compute_type)))",
            t.account
        ),
        format!(
            "create table if not exists {} (id uuid, org_name text, user_name text, compute_type text, quota_count bigint, created_at timestamp, version bigint, primary key ((org_name), created_at, id))",
            t.detail
        ),
        format!("create index if not exists on {} (id)", t.detail),
        format!(
            "create table if not exists {} (id uuid, org_id uuid, org_name text, compute_type text, quota_count bigint, used_quota bigint, default_assign_quota bigint, version bigint, primary key (org_name))",
            t.org
        ),
        format!("create index if not exists on {} (id)", t.org),
        format!(
            "create table if not exists {} (id uuid, user_name text, space_id text, compute_type text, quota_count bigint, created_at timestamp, version bigint, primary key ((user_name, compute_type), space_id))",
            t.account_record
        ),
        format!("create index if not exists on {} (id)", t.account_record),
        format!(
            "create table if not exists {} (id uuid primary key, created timestamp, task blob, tag uuid, lease_expires timestamp, attempts int, done boolean, dead boolean)",
            t.tasks
        ),
    ]
}

/// `computility`-specific ScyllaDB Session type
///
/// Instantiate this via [Session::new] with connection info & credentials if need be, when dropped
/// the ScyllaDB session will be terminated.
pub struct Session {
    session: ScyllaSession,
    /// An [EnumMap] is a map whose keys are enum values where all values are guaranteed to be
    /// represented, so indexing can't fail.
    prepared_statements: EnumMap<PreparedStatements, PreparedStatement>,
}

impl Session {
    /// Prepare a statement
    async fn prepare(scylla: &ScyllaSession, stmt: String) -> Result<PreparedStatement> {
        scylla
            .prepare(stmt.as_str())
            .await
            .context(PrepareSnafu { stmt })
    }

    /// [Session] constructor
    ///
    /// `hosts` need to be parsable as socket addresses. `credentials`, if non-None, should be a
    /// pair of strings consisting of the username & password. The keyspace must already exist; the
    /// tables within it are created if need be.
    pub async fn new(
        hosts: impl IntoIterator<Item = impl AsRef<str>>,
        credentials: &Option<(SecretString, SecretString)>,
        keyspace: &str,
        tables: &Tables,
    ) -> Result<Session> {
        let mut builder = SessionBuilder::new().known_nodes(hosts);
        if let Some((user, pass)) = credentials {
            builder = builder.user(user.expose_secret(), pass.expose_secret())
        }
        let scylla = builder.build().await.context(NewSessionSnafu)?;
        scylla
            .use_keyspace(keyspace, false)
            .await
            .context(KeyspaceSnafu { keyspace })?;

        for stmt in schema(tables) {
            scylla
                .query_unpaged(stmt.as_str(), ())
                .await
                .context(SchemaSnafu { stmt })?;
        }
        info!("ScyllaDB tables are in place in keyspace {keyspace}");

        // Prepare every statement, in variant order, so that the result can be handed straight to
        // `EnumMap::from_array`.
        let prepared_statements = stream::iter(
            (0..PreparedStatements::LENGTH).map(|i| PreparedStatements::from_usize(i).cql(tables)),
        )
        .then(|s| Self::prepare(&scylla, s))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<PreparedStatement>>>()?;
        let prepared_statements: [PreparedStatement; PreparedStatements::LENGTH] =
            prepared_statements
                .try_into()
                .map_err(|_| BadPreparedStatementCountSnafu.build())?;

        Ok(Session {
            session: scylla,
            prepared_statements: EnumMap::from_array(prepared_statements),
        })
    }

    fn stmt(&self, which: PreparedStatements) -> &PreparedStatement {
        &self.prepared_statements[which]
    }
}

/// Did a lightweight transaction apply?
///
/// The first column of an LWT result is the boolean `[applied]`; when it's false, the current
/// values of the conditioned columns follow, so the row's shape varies & we read it untyped.
fn applied(result: QueryResult) -> StdResult<bool, StorError> {
    result
        .into_rows_result()?
        .maybe_first_row::<Row>()?
        .and_then(|row| row.columns.into_iter().next().flatten())
        .is_some_and(|value| matches!(value, CqlValue::Boolean(true)))
        .pipe(Ok)
}

fn conflict_unless(applied: bool, entity: &'static str) -> StdResult<(), StorError> {
    ensure!(applied, ConcurrentUpdateSnafu { entity });
    Ok(())
}

#[async_trait]
impl AccountStore for Session {
    async fn add_account(&self, a: &ComputilityAccount) -> StdResult<(), StorError> {
        let result = self
            .session
            .execute_unpaged(
                self.stmt(PreparedStatements::InsertAccount),
                (
                    a.id,
                    &a.user_name,
                    a.compute_type,
                    a.quota_count,
                    a.used_quota,
                    a.created_at,
                    a.version,
                ),
            )
            .await?;
        ensure!(
            applied(result)?,
            DuplicateSnafu {
                entity: "account",
                key: format!("{}/{}", a.user_name, a.compute_type),
            }
        );
        Ok(())
    }
    async fn account(
        &self,
        index: &AccountIndex,
    ) -> StdResult<Option<ComputilityAccount>, StorError> {
        self.session
            .execute_unpaged(
                self.stmt(PreparedStatements::SelectAccount),
                (&index.user_name, index.compute_type),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<ComputilityAccount>()?
            .pipe(Ok)
    }
    async fn update_account(
        &self,
        prior: &ComputilityAccount,
        updated: &ComputilityAccount,
    ) -> StdResult<(), StorError> {
        let result = self
            .session
            .execute_unpaged(
                self.stmt(PreparedStatements::UpdateAccount),
                (
                    updated.quota_count,
                    updated.used_quota,
                    updated.version,
                    &prior.user_name,
                    prior.compute_type,
                    prior.version,
                ),
            )
            .await?;
        conflict_unless(applied(result)?, "account")
    }
    async fn cancel_account(&self, index: &AccountIndex) -> StdResult<bool, StorError> {
        self.session
            .execute_unpaged(
                self.stmt(PreparedStatements::CancelAccount),
                (&index.user_name, index.compute_type),
            )
            .await?
            .pipe(applied)
    }
}

#[async_trait]
impl DetailStore for Session {
    async fn add_detail(&self, d: &ComputilityDetail) -> StdResult<(), StorError> {
        let result = self
            .session
            .execute_unpaged(
                self.stmt(PreparedStatements::InsertDetail),
                (
                    d.id,
                    &d.org_name,
                    &d.user_name,
                    d.compute_type,
                    d.quota_count,
                    d.created_at,
                    d.version,
                ),
            )
            .await?;
        ensure!(
            applied(result)?,
            DuplicateSnafu {
                entity: "detail",
                key: d.id.to_string(),
            }
        );
        Ok(())
    }
    async fn detail(&self, index: &DetailIndex) -> StdResult<Option<ComputilityDetail>, StorError> {
        // Rows come back in clustering order, oldest first
        self.session
            .execute_unpaged(
                self.stmt(PreparedStatements::SelectDetail),
                (&index.org_name, &index.user_name),
            )
            .await?
            .into_rows_result()?
            .rows::<ComputilityDetail>()?
            .next()
            .transpose()?
            .pipe(Ok)
    }
    async fn org_members(&self, org_name: &Account) -> StdResult<Vec<ComputilityDetail>, StorError> {
        self.session
            .execute_unpaged(
                self.stmt(PreparedStatements::SelectOrgMembers),
                (org_name,),
            )
            .await?
            .into_rows_result()?
            .rows::<ComputilityDetail>()?
            .collect::<StdResult<Vec<_>, _>>()?
            .pipe(Ok)
    }
    async fn delete_detail(&self, id: &DetailId) -> StdResult<(), StorError> {
        let key = self
            .session
            .execute_unpaged(self.stmt(PreparedStatements::SelectDetailKey), (id,))
            .await?
            .into_rows_result()?
            .maybe_first_row::<(Account, DateTime<Utc>)>()?;
        let Some((org_name, created_at)) = key else {
            return ConcurrentUpdateSnafu { entity: "detail" }.fail();
        };
        let result = self
            .session
            .execute_unpaged(
                self.stmt(PreparedStatements::DeleteDetail),
                (org_name, created_at, id),
            )
            .await?;
        conflict_unless(applied(result)?, "detail")
    }
}

#[async_trait]
impl OrgStore for Session {
    async fn add_org(&self, org: &ComputilityOrg) -> StdResult<(), StorError> {
        let result = self
            .session
            .execute_unpaged(
                self.stmt(PreparedStatements::InsertOrg),
                (
                    org.id,
                    org.org_id,
                    &org.org_name,
                    org.compute_type,
                    org.quota_count,
                    org.used_quota,
                    org.default_assign_quota,
                    org.version,
                ),
            )
            .await?;
        ensure!(
            applied(result)?,
            DuplicateSnafu {
                entity: "org",
                key: org.org_name.to_string(),
            }
        );
        Ok(())
    }
    async fn org(&self, org_name: &Account) -> StdResult<Option<ComputilityOrg>, StorError> {
        self.session
            .execute_unpaged(self.stmt(PreparedStatements::SelectOrg), (org_name,))
            .await?
            .into_rows_result()?
            .maybe_first_row::<ComputilityOrg>()?
            .pipe(Ok)
    }
    async fn update_org(
        &self,
        prior: &ComputilityOrg,
        updated: &ComputilityOrg,
    ) -> StdResult<(), StorError> {
        let result = self
            .session
            .execute_unpaged(
                self.stmt(PreparedStatements::UpdateOrg),
                (
                    updated.quota_count,
                    updated.used_quota,
                    updated.default_assign_quota,
                    updated.version,
                    &prior.org_name,
                    prior.version,
                ),
            )
            .await?;
        conflict_unless(applied(result)?, "org")
    }
    async fn delete_org(&self, id: &OrgId) -> StdResult<(), StorError> {
        let Some((org_name,)) = self
            .session
            .execute_unpaged(self.stmt(PreparedStatements::SelectOrgKey), (id,))
            .await?
            .into_rows_result()?
            .maybe_first_row::<(Account,)>()?
        else {
            return ConcurrentUpdateSnafu { entity: "org" }.fail();
        };
        let result = self
            .session
            .execute_unpaged(self.stmt(PreparedStatements::DeleteOrg), (org_name, id))
            .await?;
        conflict_unless(applied(result)?, "org")
    }
}

#[async_trait]
impl RecordStore for Session {
    async fn add_record(&self, r: &ComputilityAccountRecord) -> StdResult<(), StorError> {
        let result = self
            .session
            .execute_unpaged(
                self.stmt(PreparedStatements::InsertRecord),
                (
                    r.id,
                    &r.user_name,
                    &r.space_id,
                    r.compute_type,
                    r.quota_count,
                    r.created_at,
                    r.version,
                ),
            )
            .await?;
        ensure!(
            applied(result)?,
            DuplicateSnafu {
                entity: "account record",
                key: format!("{}/{}", r.user_name, r.space_id),
            }
        );
        Ok(())
    }
    async fn record(
        &self,
        index: &RecordIndex,
    ) -> StdResult<Option<ComputilityAccountRecord>, StorError> {
        self.session
            .execute_unpaged(
                self.stmt(PreparedStatements::SelectRecord),
                (&index.user_name, index.compute_type, &index.space_id),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<ComputilityAccountRecord>()?
            .pipe(Ok)
    }
    async fn records(
        &self,
        index: &AccountIndex,
    ) -> StdResult<Vec<ComputilityAccountRecord>, StorError> {
        self.session
            .execute_unpaged(
                self.stmt(PreparedStatements::SelectRecords),
                (&index.user_name, index.compute_type),
            )
            .await?
            .into_rows_result()?
            .rows::<ComputilityAccountRecord>()?
            .collect::<StdResult<Vec<_>, _>>()?
            .into_iter()
            .sorted_by_key(|r| r.created_at)
            .collect::<Vec<_>>()
            .pipe(Ok)
    }
    async fn update_record(
        &self,
        prior: &ComputilityAccountRecord,
        updated: &ComputilityAccountRecord,
    ) -> StdResult<(), StorError> {
        if prior.space_id == updated.space_id {
            let result = self
                .session
                .execute_unpaged(
                    self.stmt(PreparedStatements::UpdateRecord),
                    (
                        updated.quota_count,
                        updated.version,
                        &prior.user_name,
                        prior.compute_type,
                        &prior.space_id,
                        prior.version,
                    ),
                )
                .await?;
            conflict_unless(applied(result)?, "account record")
        } else {
            // `space_id` is part of the key; move the row
            self.delete_versioned_record(&prior.user_name, prior.compute_type, &prior.space_id, prior.version)
                .await?;
            self.add_record(updated).await
        }
    }
    async fn delete_record(&self, id: &RecordId) -> StdResult<(), StorError> {
        let key = self
            .session
            .execute_unpaged(self.stmt(PreparedStatements::SelectRecordKey), (id,))
            .await?
            .into_rows_result()?
            .maybe_first_row::<(Account, ComputeType, SpaceId)>()?;
        let Some((user_name, compute_type, space_id)) = key else {
            return ConcurrentUpdateSnafu {
                entity: "account record",
            }
            .fail();
        };
        let Some(record) = self
            .record(&RecordIndex {
                user_name: user_name.clone(),
                space_id: space_id.clone(),
                compute_type,
            })
            .await?
        else {
            return ConcurrentUpdateSnafu {
                entity: "account record",
            }
            .fail();
        };
        self.delete_versioned_record(&user_name, compute_type, &space_id, record.version)
            .await
    }
}

impl Session {
    async fn delete_versioned_record(
        &self,
        user_name: &Account,
        compute_type: ComputeType,
        space_id: &SpaceId,
        version: i64,
    ) -> StdResult<(), StorError> {
        let result = self
            .session
            .execute_unpaged(
                self.stmt(PreparedStatements::DeleteRecord),
                (user_name, compute_type, space_id, version),
            )
            .await?;
        conflict_unless(applied(result)?, "account record")
    }
}

impl Backend for Session {}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        background tasks                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn task_error(err: impl Into<StorError>) -> background_tasks::Error {
    background_tasks::Error::new(err.into())
}

#[async_trait]
impl background_tasks::Backend for Session {
    async fn write_task(&self, tag: &Uuid, buf: &[u8]) -> background_tasks::Result<()> {
        let task = FlatTask::new(tag, buf);
        self.session
            .execute_unpaged(
                self.stmt(PreparedStatements::InsertTask),
                (
                    task.id,
                    task.created,
                    task.task,
                    task.tag,
                    task.lease_expires,
                    task.attempts,
                    task.done,
                    task.dead,
                ),
            )
            .await
            .map_err(task_error)
            .map(|_| ())
    }
    async fn lease_task(&self, lease: Duration) -> background_tasks::Result<Option<LeasedTask>> {
        let now = Utc::now();
        let candidates = self
            .session
            .execute_unpaged(self.stmt(PreparedStatements::SelectOpenTasks), ())
            .await
            .map_err(task_error)?
            .into_rows_result()
            .map_err(task_error)?
            .rows::<FlatTask>()
            .map_err(task_error)?
            .collect::<StdResult<Vec<_>, _>>()
            .map_err(task_error)?
            .into_iter()
            .filter(|t| t.is_available(&now))
            .sorted_by_key(|t| t.created);
        let expires = FlatTask::lease_expiry(now, lease);
        // Claim the oldest candidate no one else beats us to
        for task in candidates {
            let result = self
                .session
                .execute_unpaged(
                    self.stmt(PreparedStatements::LeaseTask),
                    (
                        expires,
                        task.attempts + 1,
                        task.id,
                        task.lease_expires,
                        task.attempts,
                    ),
                )
                .await
                .map_err(task_error)?;
            if applied(result).map_err(task_error)? {
                return Ok(Some(LeasedTask {
                    tag: task.tag,
                    id: task.id,
                    buf: task.task,
                    attempts: task.attempts + 1,
                }));
            }
        }
        Ok(None)
    }
    async fn close_task(&self, uuid: &Uuid) -> background_tasks::Result<()> {
        self.session
            .execute_unpaged(self.stmt(PreparedStatements::CloseTask), (uuid,))
            .await
            .map_err(task_error)
            .map(|_| ())
    }
    async fn fail_task(
        &self,
        uuid: &Uuid,
        retry_at: Option<DateTime<Utc>>,
    ) -> background_tasks::Result<()> {
        match retry_at {
            Some(retry_at) => {
                self.session
                    .execute_unpaged(self.stmt(PreparedStatements::RetryTask), (retry_at, uuid))
                    .await
            }
            None => {
                self.session
                    .execute_unpaged(self.stmt(PreparedStatements::KillTask), (uuid,))
                    .await
            }
        }
        .map_err(task_error)
        .map(|_| ())
    }
    async fn dead_letters(&self) -> background_tasks::Result<Vec<FlatTask>> {
        self.session
            .execute_unpaged(self.stmt(PreparedStatements::SelectDeadTasks), ())
            .await
            .map_err(task_error)?
            .into_rows_result()
            .map_err(task_error)?
            .rows::<FlatTask>()
            .map_err(task_error)?
            .collect::<StdResult<Vec<_>, _>>()
            .map_err(task_error)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statements_name_the_configured_tables() {
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
        assert_eq!(
            PreparedStatements::UpdateAccount.cql(&tables),
            "update accounts set quota_count=?, used_quota=?, version=? where user_name=? and compute_type=? if version=?"
        );
        // Every statement mentions exactly one table
        for i in 0..PreparedStatements::LENGTH {
            let cql = PreparedStatements::from_usize(i).cql(&tables);
            assert_eq!(
                ["orgs", "details", "accounts", "records", "tasks"]
                    .iter()
                    .filter(|t| cql.contains(&format!(" {} ", t)) || cql.contains(&format!(" {} (", t)))
                    .count(),
                1,
                "{cql}"
            );
        }
        assert_eq!(schema(&tables).len(), 8);
    }
}
