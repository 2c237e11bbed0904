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

//! # postgres
//!
//! [Storage] implementation for PostgreSQL.
//!
//! [Storage]: crate::storage
//!
//! Rows are read into `Db*` structs (plain column types) & converted into entities, re-validating
//! names & compute types on the way in. Table names are configurable & so are formatted into the
//! statement text; [TableName] guarantees they're safe to interpolate.
//!
//! [TableName]: crate::util::TableName
//!
//! [Backend::commit] runs the whole batch in one transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use sqlx::{
    FromRow, PgConnection, PgPool,
    postgres::{PgPoolOptions, PgQueryResult},
};
use tap::Pipe;
use tracing::info;
use uuid::Uuid;

use crate::{
    background_tasks::{self, FlatTask, LeasedTask},
    entities::{
        self, Account, AccountIndex, ComputilityAccount, ComputilityAccountRecord,
        ComputilityDetail, ComputilityOrg, DetailId, DetailIndex, OrgId, RecordId, RecordIndex,
        SpaceId,
    },
    storage::{
        AccountStore, Backend, ConcurrentUpdateSnafu, DetailStore, DuplicateSnafu, Error,
        OrgStore, RecordStore, Result, Write,
    },
    util::Tables,
};

fn backend_error(err: sqlx::Error) -> Error {
    Error::new(err)
}

fn entity_error(err: entities::Error) -> Error {
    Error::new(err)
}

/// Map a unique-constraint violation to [Error::Duplicate]
fn duplicate_or(entity: &'static str, key: String) -> impl FnOnce(sqlx::Error) -> Error {
    move |err| match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            DuplicateSnafu { entity, key }.build()
        }
        _ => Error::new(err),
    }
}

/// Zero rows affected by a versioned update or delete means someone else got there first
fn exactly_one(entity: &'static str) -> impl FnOnce(PgQueryResult) -> Result<()> {
    move |res| {
        ensure!(res.rows_affected() == 1, ConcurrentUpdateSnafu { entity });
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           row types                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, FromRow)]
struct DbAccount {
    id: Uuid,
    user_name: String,
    compute_type: String,
    quota_count: i64,
    used_quota: i64,
    created_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<DbAccount> for ComputilityAccount {
    type Error = entities::Error;

    fn try_from(row: DbAccount) -> std::result::Result<Self, Self::Error> {
        Ok(ComputilityAccount {
            id: row.id.into(),
            user_name: Account::try_from(row.user_name)?,
            compute_type: row.compute_type.parse()?,
            quota_count: row.quota_count,
            used_quota: row.used_quota,
            created_at: row.created_at,
            version: row.version,
        })
    }
}

#[derive(Debug, FromRow)]
struct DbDetail {
    id: Uuid,
    org_name: String,
    user_name: String,
    compute_type: String,
    quota_count: i64,
    created_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<DbDetail> for ComputilityDetail {
    type Error = entities::Error;

    fn try_from(row: DbDetail) -> std::result::Result<Self, Self::Error> {
        Ok(ComputilityDetail {
            id: row.id.into(),
            org_name: Account::try_from(row.org_name)?,
            user_name: Account::try_from(row.user_name)?,
            compute_type: row.compute_type.parse()?,
            quota_count: row.quota_count,
            created_at: row.created_at,
            version: row.version,
        })
    }
}

#[derive(Debug, FromRow)]
struct DbOrg {
    id: Uuid,
    org_id: Uuid,
    org_name: String,
    compute_type: String,
    quota_count: i64,
    used_quota: i64,
    default_assign_quota: i64,
    version: i64,
}

impl TryFrom<DbOrg> for ComputilityOrg {
    type Error = entities::Error;

    fn try_from(row: DbOrg) -> std::result::Result<Self, Self::Error> {
        Ok(ComputilityOrg {
            id: row.id.into(),
            org_id: row.org_id,
            org_name: Account::try_from(row.org_name)?,
            compute_type: row.compute_type.parse()?,
            quota_count: row.quota_count,
            used_quota: row.used_quota,
            default_assign_quota: row.default_assign_quota,
            version: row.version,
        })
    }
}

#[derive(Debug, FromRow)]
struct DbRecord {
    id: Uuid,
    user_name: String,
    space_id: String,
    compute_type: String,
    quota_count: i64,
    created_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<DbRecord> for ComputilityAccountRecord {
    type Error = entities::Error;

    fn try_from(row: DbRecord) -> std::result::Result<Self, Self::Error> {
        Ok(ComputilityAccountRecord {
            id: row.id.into(),
            user_name: Account::try_from(row.user_name)?,
            space_id: SpaceId::try_from(row.space_id)?,
            compute_type: row.compute_type.parse()?,
            quota_count: row.quota_count,
            created_at: row.created_at,
            version: row.version,
        })
    }
}

fn convert<R, T: TryFrom<R, Error = entities::Error>>(rows: Vec<R>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| T::try_from(row).map_err(entity_error))
        .collect()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Session                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A PostgreSQL-backed computility store
pub struct Session {
    pool: PgPool,
    tables: Tables,
}

impl Session {
    /// Connect to `url`, creating any missing tables
    pub async fn new(url: &str, max_connections: u32, tables: Tables) -> Result<Session> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(backend_error)?;
        let session = Session { pool, tables };
        session.create_tables().await?;
        Ok(session)
    }

    async fn create_tables(&self) -> Result<()> {
        let t = &self.tables;
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                     id UUID PRIMARY KEY,
                     org_id UUID NOT NULL,
                     org_name TEXT NOT NULL UNIQUE,
                     compute_type TEXT NOT NULL,
                     quota_count BIGINT NOT NULL,
                     used_quota BIGINT NOT NULL,
                     default_assign_quota BIGINT NOT NULL,
                     version BIGINT NOT NULL)",
                t.org
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                     id UUID PRIMARY KEY,
                     org_name TEXT NOT NULL,
                     user_name TEXT NOT NULL,
                     compute_type TEXT NOT NULL,
                     quota_count BIGINT NOT NULL,
                     created_at TIMESTAMPTZ NOT NULL,
                     version BIGINT NOT NULL)",
                t.detail
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_org_user ON {0} (org_name, user_name)",
                t.detail
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                     id UUID PRIMARY KEY,
                     user_name TEXT NOT NULL,
                     compute_type TEXT NOT NULL,
                     quota_count BIGINT NOT NULL,
                     used_quota BIGINT NOT NULL,
                     created_at TIMESTAMPTZ NOT NULL,
                     version BIGINT NOT NULL)",
                t.account
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {0}_user_type ON {0} (user_name, compute_type)",
                t.account
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                     id UUID PRIMARY KEY,
                     user_name TEXT NOT NULL,
                     space_id TEXT NOT NULL,
                     compute_type TEXT NOT NULL,
                     quota_count BIGINT NOT NULL,
                     created_at TIMESTAMPTZ NOT NULL,
                     version BIGINT NOT NULL,
                     UNIQUE (user_name, space_id, compute_type))",
                t.account_record
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                     id UUID PRIMARY KEY,
                     created TIMESTAMPTZ NOT NULL,
                     task BYTEA NOT NULL,
                     tag UUID NOT NULL,
                     lease_expires TIMESTAMPTZ NOT NULL,
                     attempts INTEGER NOT NULL,
                     done BOOLEAN NOT NULL,
                     dead BOOLEAN NOT NULL)",
                t.tasks
            ),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend_error)?;
        }
        info!("PostgreSQL tables are in place");
        Ok(())
    }

    /// Apply a single write on `conn`
    async fn apply(&self, conn: &mut PgConnection, write: &Write) -> Result<()> {
        let t = &self.tables;
        match write {
            Write::AddAccount(a) => sqlx::query(&format!(
                "INSERT INTO {} (id, user_name, compute_type, quota_count, used_quota, created_at, version)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                t.account
            ))
            .bind(*a.id)
            .bind(a.user_name.as_ref())
            .bind(a.compute_type.as_str())
            .bind(a.quota_count)
            .bind(a.used_quota)
            .bind(a.created_at)
            .bind(a.version)
            .execute(conn)
            .await
            .map_err(duplicate_or(
                "account",
                format!("{}/{}", a.user_name, a.compute_type),
            ))
            .map(|_| ()),
            Write::UpdateAccount { prior, updated } => sqlx::query(&format!(
                "UPDATE {} SET quota_count = $1, used_quota = $2, version = $3
                 WHERE id = $4 AND version = $5",
                t.account
            ))
            .bind(updated.quota_count)
            .bind(updated.used_quota)
            .bind(updated.version)
            .bind(*prior.id)
            .bind(prior.version)
            .execute(conn)
            .await
            .map_err(backend_error)?
            .pipe(exactly_one("account")),
            Write::CancelAccount(index) => sqlx::query(&format!(
                "DELETE FROM {} WHERE user_name = $1 AND compute_type = $2
                 AND quota_count = 0 AND used_quota = 0",
                t.account
            ))
            .bind(index.user_name.as_ref())
            .bind(index.compute_type.as_str())
            .execute(conn)
            .await
            .map_err(backend_error)
            .map(|_| ()),
            Write::AddDetail(d) => sqlx::query(&format!(
                "INSERT INTO {} (id, org_name, user_name, compute_type, quota_count, created_at, version)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                t.detail
            ))
            .bind(*d.id)
            .bind(d.org_name.as_ref())
            .bind(d.user_name.as_ref())
            .bind(d.compute_type.as_str())
            .bind(d.quota_count)
            .bind(d.created_at)
            .bind(d.version)
            .execute(conn)
            .await
            .map_err(duplicate_or("detail", d.id.to_string()))
            .map(|_| ()),
            Write::DeleteDetail(id) => {
                sqlx::query(&format!("DELETE FROM {} WHERE id = $1", t.detail))
                    .bind(**id)
                    .execute(conn)
                    .await
                    .map_err(backend_error)?
                    .pipe(exactly_one("detail"))
            }
            Write::UpdateOrg { prior, updated } => sqlx::query(&format!(
                "UPDATE {} SET quota_count = $1, used_quota = $2, default_assign_quota = $3, version = $4
                 WHERE id = $5 AND version = $6",
                t.org
            ))
            .bind(updated.quota_count)
            .bind(updated.used_quota)
            .bind(updated.default_assign_quota)
            .bind(updated.version)
            .bind(*prior.id)
            .bind(prior.version)
            .execute(conn)
            .await
            .map_err(backend_error)?
            .pipe(exactly_one("org")),
            Write::DeleteOrg(id) => sqlx::query(&format!("DELETE FROM {} WHERE id = $1", t.org))
                .bind(**id)
                .execute(conn)
                .await
                .map_err(backend_error)?
                .pipe(exactly_one("org")),
            Write::AddRecord(r) => sqlx::query(&format!(
                "INSERT INTO {} (id, user_name, space_id, compute_type, quota_count, created_at, version)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                t.account_record
            ))
            .bind(*r.id)
            .bind(r.user_name.as_ref())
            .bind(r.space_id.as_ref())
            .bind(r.compute_type.as_str())
            .bind(r.quota_count)
            .bind(r.created_at)
            .bind(r.version)
            .execute(conn)
            .await
            .map_err(duplicate_or(
                "account record",
                format!("{}/{}", r.user_name, r.space_id),
            ))
            .map(|_| ()),
            Write::UpdateRecord { prior, updated } => sqlx::query(&format!(
                "UPDATE {} SET space_id = $1, quota_count = $2, version = $3
                 WHERE id = $4 AND version = $5",
                t.account_record
            ))
            .bind(updated.space_id.as_ref())
            .bind(updated.quota_count)
            .bind(updated.version)
            .bind(*prior.id)
            .bind(prior.version)
            .execute(conn)
            .await
            .map_err(duplicate_or(
                "account record",
                format!("{}/{}", updated.user_name, updated.space_id),
            ))?
            .pipe(exactly_one("account record")),
            Write::DeleteRecord(id) => {
                sqlx::query(&format!("DELETE FROM {} WHERE id = $1", t.account_record))
                    .bind(**id)
                    .execute(conn)
                    .await
                    .map_err(backend_error)?
                    .pipe(exactly_one("account record"))
            }
        }
    }

    async fn apply1(&self, write: Write) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(backend_error)?;
        self.apply(&mut conn, &write).await
    }
}

#[async_trait]
impl AccountStore for Session {
    async fn add_account(&self, account: &ComputilityAccount) -> Result<()> {
        self.apply1(Write::AddAccount(account.clone())).await
    }
    async fn account(&self, index: &AccountIndex) -> Result<Option<ComputilityAccount>> {
        sqlx::query_as::<_, DbAccount>(&format!(
            "SELECT * FROM {} WHERE user_name = $1 AND compute_type = $2",
            self.tables.account
        ))
        .bind(index.user_name.as_ref())
        .bind(index.compute_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?
        .map(ComputilityAccount::try_from)
        .transpose()
        .map_err(entity_error)
    }
    async fn update_account(
        &self,
        prior: &ComputilityAccount,
        updated: &ComputilityAccount,
    ) -> Result<()> {
        self.apply1(Write::UpdateAccount {
            prior: prior.clone(),
            updated: updated.clone(),
        })
        .await
    }
    async fn cancel_account(&self, index: &AccountIndex) -> Result<bool> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE user_name = $1 AND compute_type = $2
             AND quota_count = 0 AND used_quota = 0",
            self.tables.account
        ))
        .bind(index.user_name.as_ref())
        .bind(index.compute_type.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend_error)
        .map(|res| res.rows_affected() > 0)
    }
}

#[async_trait]
impl DetailStore for Session {
    async fn add_detail(&self, detail: &ComputilityDetail) -> Result<()> {
        self.apply1(Write::AddDetail(detail.clone())).await
    }
    async fn detail(&self, index: &DetailIndex) -> Result<Option<ComputilityDetail>> {
        sqlx::query_as::<_, DbDetail>(&format!(
            "SELECT * FROM {} WHERE org_name = $1 AND user_name = $2
             ORDER BY created_at, id LIMIT 1",
            self.tables.detail
        ))
        .bind(index.org_name.as_ref())
        .bind(index.user_name.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?
        .map(ComputilityDetail::try_from)
        .transpose()
        .map_err(entity_error)
    }
    async fn org_members(&self, org_name: &Account) -> Result<Vec<ComputilityDetail>> {
        sqlx::query_as::<_, DbDetail>(&format!(
            "SELECT * FROM {} WHERE org_name = $1 ORDER BY created_at, id",
            self.tables.detail
        ))
        .bind(org_name.as_ref())
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?
        .pipe(convert)
    }
    async fn delete_detail(&self, id: &DetailId) -> Result<()> {
        self.apply1(Write::DeleteDetail(*id)).await
    }
}

#[async_trait]
impl OrgStore for Session {
    async fn add_org(&self, org: &ComputilityOrg) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, org_id, org_name, compute_type, quota_count, used_quota,
                             default_assign_quota, version)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.tables.org
        ))
        .bind(*org.id)
        .bind(org.org_id)
        .bind(org.org_name.as_ref())
        .bind(org.compute_type.as_str())
        .bind(org.quota_count)
        .bind(org.used_quota)
        .bind(org.default_assign_quota)
        .bind(org.version)
        .execute(&self.pool)
        .await
        .map_err(duplicate_or("org", org.org_name.to_string()))
        .map(|_| ())
    }
    async fn org(&self, org_name: &Account) -> Result<Option<ComputilityOrg>> {
        sqlx::query_as::<_, DbOrg>(&format!(
            "SELECT * FROM {} WHERE org_name = $1",
            self.tables.org
        ))
        .bind(org_name.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?
        .map(ComputilityOrg::try_from)
        .transpose()
        .map_err(entity_error)
    }
    async fn update_org(&self, prior: &ComputilityOrg, updated: &ComputilityOrg) -> Result<()> {
        self.apply1(Write::UpdateOrg {
            prior: prior.clone(),
            updated: updated.clone(),
        })
        .await
    }
    async fn delete_org(&self, id: &OrgId) -> Result<()> {
        self.apply1(Write::DeleteOrg(*id)).await
    }
}

#[async_trait]
impl RecordStore for Session {
    async fn add_record(&self, record: &ComputilityAccountRecord) -> Result<()> {
        self.apply1(Write::AddRecord(record.clone())).await
    }
    async fn record(&self, index: &RecordIndex) -> Result<Option<ComputilityAccountRecord>> {
        sqlx::query_as::<_, DbRecord>(&format!(
            "SELECT * FROM {} WHERE user_name = $1 AND space_id = $2 AND compute_type = $3",
            self.tables.account_record
        ))
        .bind(index.user_name.as_ref())
        .bind(index.space_id.as_ref())
        .bind(index.compute_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?
        .map(ComputilityAccountRecord::try_from)
        .transpose()
        .map_err(entity_error)
    }
    async fn records(&self, index: &AccountIndex) -> Result<Vec<ComputilityAccountRecord>> {
        sqlx::query_as::<_, DbRecord>(&format!(
            "SELECT * FROM {} WHERE user_name = $1 AND compute_type = $2 ORDER BY created_at",
            self.tables.account_record
        ))
        .bind(index.user_name.as_ref())
        .bind(index.compute_type.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?
        .pipe(convert)
    }
    async fn update_record(
        &self,
        prior: &ComputilityAccountRecord,
        updated: &ComputilityAccountRecord,
    ) -> Result<()> {
        self.apply1(Write::UpdateRecord {
            prior: prior.clone(),
            updated: updated.clone(),
        })
        .await
    }
    async fn delete_record(&self, id: &RecordId) -> Result<()> {
        self.apply1(Write::DeleteRecord(*id)).await
    }
}

#[async_trait]
impl Backend for Session {
    async fn commit(&self, writes: &[Write]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(backend_error)?;
        for write in writes {
            // Dropping `tx` without committing rolls it back
            self.apply(&mut tx, write).await?;
        }
        tx.commit().await.map_err(backend_error)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        background tasks                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn task_error(err: sqlx::Error) -> background_tasks::Error {
    background_tasks::Error::new(err)
}

#[async_trait]
impl background_tasks::Backend for Session {
    async fn write_task(&self, tag: &Uuid, buf: &[u8]) -> background_tasks::Result<()> {
        let task = FlatTask::new(tag, buf);
        sqlx::query(&format!(
            "INSERT INTO {} (id, created, task, tag, lease_expires, attempts, done, dead)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.tables.tasks
        ))
        .bind(task.id)
        .bind(task.created)
        .bind(&task.task)
        .bind(task.tag)
        .bind(task.lease_expires)
        .bind(task.attempts)
        .bind(task.done)
        .bind(task.dead)
        .execute(&self.pool)
        .await
        .map_err(task_error)
        .map(|_| ())
    }
    async fn lease_task(&self, lease: Duration) -> background_tasks::Result<Option<LeasedTask>> {
        let now = Utc::now();
        let expires = FlatTask::lease_expiry(now, lease);
        // `SKIP LOCKED` lets concurrent processors each claim a different task
        sqlx::query_as::<_, (Uuid, Uuid, Vec<u8>, i32)>(&format!(
            "UPDATE {0} SET lease_expires = $1, attempts = attempts + 1
             WHERE id = (SELECT id FROM {0}
                         WHERE NOT done AND NOT dead AND lease_expires <= $2
                         ORDER BY created LIMIT 1
                         FOR UPDATE SKIP LOCKED)
             RETURNING tag, id, task, attempts",
            self.tables.tasks
        ))
        .bind(expires)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(task_error)?
        .map(|(tag, id, buf, attempts)| LeasedTask {
            tag,
            id,
            buf,
            attempts,
        })
        .pipe(Ok)
    }
    async fn close_task(&self, uuid: &Uuid) -> background_tasks::Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET done = TRUE WHERE id = $1",
            self.tables.tasks
        ))
        .bind(uuid)
        .execute(&self.pool)
        .await
        .map_err(task_error)
        .map(|_| ())
    }
    async fn fail_task(
        &self,
        uuid: &Uuid,
        retry_at: Option<DateTime<Utc>>,
    ) -> background_tasks::Result<()> {
        let sql = match retry_at {
            Some(_) => format!(
                "UPDATE {} SET lease_expires = $1 WHERE id = $2",
                self.tables.tasks
            ),
            None => format!("UPDATE {} SET dead = TRUE WHERE id = $1", self.tables.tasks),
        };
        let query = match retry_at {
            Some(retry_at) => sqlx::query(&sql).bind(retry_at).bind(uuid),
            None => sqlx::query(&sql).bind(uuid),
        };
        query
            .execute(&self.pool)
            .await
            .map_err(task_error)
            .map(|_| ())
    }
    async fn dead_letters(&self) -> background_tasks::Result<Vec<FlatTask>> {
        sqlx::query_as::<_, FlatTask>(&format!(
            "SELECT * FROM {} WHERE dead ORDER BY created",
            self.tables.tasks
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(task_error)
    }
}
