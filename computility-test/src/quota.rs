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

//! Integration tests for the quota API.
//!
//! Backend-agnostic test logic for the quota API goes here.

use std::sync::Arc;

use chrono::Duration;
use computility::{
    entities::Account,
    http::ErrorResponseBody,
    quota::{AccountQuotaDetail, QuotaRecall},
    signing_keys::{KeyId, SigningKey},
    token::mint_token,
};
use libtest_mimic::Failed;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde_json::{Value, json};

use crate::Helper;

/// A client for the internal endpoints; every request carries the internal token
struct Internal {
    client: Client,
    url: Url,
    token: String,
}

impl Internal {
    fn new(url: Url, token: String) -> Internal {
        Internal {
            client: Client::new(),
            url,
            token,
        }
    }
    async fn send(&self, method: Method, path: &str, body: Value) -> Result<Response, Failed> {
        Ok(self
            .client
            .request(method, self.url.join(&format!("/v1/computility{path}"))?)
            .header("TOKEN", &self.token)
            .json(&body)
            .send()
            .await?)
    }
    async fn create_org(&self, org_name: &str, quota: i64) -> Result<Response, Failed> {
        self.send(
            Method::POST,
            "/org",
            json!({"org_name": org_name, "compute_type": "npu", "default_assign_quota": quota}),
        )
        .await
    }
    async fn join(&self, org_name: &str, user_name: &str) -> Result<Response, Failed> {
        self.send(
            Method::POST,
            "/account",
            json!({"org_name": org_name, "user_name": user_name}),
        )
        .await
    }
    async fn remove(&self, org_name: &str, user_name: &str) -> Result<Response, Failed> {
        self.send(
            Method::PUT,
            "/account/remove",
            json!({"org_name": org_name, "user_name": user_name}),
        )
        .await
    }
    async fn consume(
        &self,
        user_name: &str,
        quota_count: i64,
        space_id: Option<&str>,
    ) -> Result<Response, Failed> {
        self.send(
            Method::PUT,
            "/account/consume",
            json!({"user_name": user_name, "compute_type": "npu", "quota_count": quota_count, "space_id": space_id}),
        )
        .await
    }
    async fn release(
        &self,
        user_name: &str,
        quota_count: i64,
        space_id: Option<&str>,
    ) -> Result<Response, Failed> {
        self.send(
            Method::PUT,
            "/account/release",
            json!({"user_name": user_name, "compute_type": "npu", "quota_count": quota_count, "space_id": space_id}),
        )
        .await
    }
}

/// Walk one member through the life of their quota: join, consume, move a space, release, leave
pub async fn org_lifecycle(
    url: Url,
    token: String,
    helper: Arc<dyn Helper + Send + Sync>,
) -> Result<(), Failed> {
    helper.clear().await?;
    let api = Internal::new(url, token);

    let rsp = api.create_org("acme-corp", 4).await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    let rsp = api.create_org("acme-corp", 4).await?;
    assert_eq!(StatusCode::CONFLICT, rsp.status());
    assert_eq!("org_exists", rsp.json::<ErrorResponseBody>().await?.code);

    let rsp = api.join("acme-corp", "alice").await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    assert_eq!("success", rsp.json::<String>().await?);

    let rsp = api.consume("alice", 3, Some("space-1")).await?;
    assert_eq!(StatusCode::ACCEPTED, rsp.status());
    // Only one left
    let rsp = api.consume("alice", 2, None).await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!("insufficient_quota", rsp.json::<ErrorResponseBody>().await?.code);
    let rsp = api.consume("alice", 1, None).await?;
    assert_eq!(StatusCode::ACCEPTED, rsp.status());

    let rsp = api
        .send(
            Method::PUT,
            "/account/supply",
            json!({"user_name": "alice", "compute_type": "npu", "space_id": "space-1", "new_space_id": "space-2"}),
        )
        .await?;
    assert_eq!(StatusCode::ACCEPTED, rsp.status());

    let rsp = api.release("alice", 1, None).await?;
    assert_eq!(StatusCode::ACCEPTED, rsp.status());
    let rsp = api.release("alice", 0, None).await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(
        "bad_request_param",
        rsp.json::<ErrorResponseBody>().await?.code
    );

    // alice is using three of her four; taking all four back leaves her three in debt
    let rsp = api.remove("acme-corp", "alice").await?;
    assert_eq!(StatusCode::ACCEPTED, rsp.status());
    let recall = rsp.json::<QuotaRecall>().await?;
    assert_eq!(3, recall.quota_debt);
    assert_eq!(1, recall.records.len());
    assert_eq!("space-2", recall.records[0].space_id.as_ref());

    let rsp = api.remove("acme-corp", "alice").await?;
    assert_eq!(StatusCode::NOT_FOUND, rsp.status());

    Ok(())
}

/// The internal endpoints must refuse callers without the right token
pub async fn internal_token_required(url: Url, token: String) -> Result<(), Failed> {
    let rsp = Internal::new(url.clone(), format!("{token}-not"))
        .join("acme-corp", "mallory")
        .await?;
    assert_eq!(StatusCode::UNAUTHORIZED, rsp.status());

    let rsp = Client::new()
        .post(url.join("/v1/computility/account")?)
        .json(&json!({"org_name": "acme-corp", "user_name": "mallory"}))
        .send()
        .await?;
    assert_eq!(StatusCode::UNAUTHORIZED, rsp.status());
    assert_eq!("unauthorized", rsp.json::<ErrorResponseBody>().await?.code);
    Ok(())
}

/// Users may look up their own accounts, given a token from the web front end
pub async fn account_detail(
    url: Url,
    token: String,
    keyid: KeyId,
    key: SigningKey,
    issuer: String,
    helper: Arc<dyn Helper + Send + Sync>,
) -> Result<(), Failed> {
    helper.clear().await?;
    let api = Internal::new(url.clone(), token);
    assert_eq!(
        StatusCode::CREATED,
        api.create_org("initech", 5).await?.status()
    );
    assert_eq!(
        StatusCode::CREATED,
        api.join("initech", "bobby").await?.status()
    );
    assert_eq!(
        StatusCode::ACCEPTED,
        api.consume("bobby", 2, Some("tps-reports")).await?.status()
    );

    let bobby = Account::new("bobby")?;
    let jwt = mint_token(&bobby, &keyid, &key, &issuer, &Duration::seconds(300))?;
    let client = Client::new();

    let rsp = client
        .get(url.join("/v1/computility/account/npu")?)
        .bearer_auth(&jwt)
        .send()
        .await?;
    assert_eq!(StatusCode::OK, rsp.status());
    let detail = rsp.json::<AccountQuotaDetail>().await?;
    assert_eq!(bobby, detail.user_name);
    assert_eq!(5, detail.total_quota);
    assert_eq!(2, detail.used_quota);
    assert_eq!(3, detail.quota_balance);

    let rsp = client
        .get(url.join("/v1/computility/account/gpu")?)
        .bearer_auth(&jwt)
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());

    let rsp = client
        .get(url.join("/v1/computility/account/npu")?)
        .send()
        .await?;
    assert_eq!(StatusCode::UNAUTHORIZED, rsp.status());

    // Nobody by that name has an account
    let peter = Account::new("peter")?;
    let jwt = mint_token(&peter, &keyid, &key, &issuer, &Duration::seconds(300))?;
    let rsp = client
        .get(url.join("/v1/computility/account/npu")?)
        .bearer_auth(&jwt)
        .send()
        .await?;
    assert_eq!(StatusCode::NOT_FOUND, rsp.status());

    Ok(())
}

/// Deleting an org recalls quota from every member
pub async fn org_delete(
    url: Url,
    token: String,
    helper: Arc<dyn Helper + Send + Sync>,
) -> Result<(), Failed> {
    helper.clear().await?;
    let api = Internal::new(url, token);
    assert_eq!(
        StatusCode::CREATED,
        api.create_org("globex", 2).await?.status()
    );
    for user in ["homer", "lenny", "carl1"] {
        assert_eq!(StatusCode::CREATED, api.join("globex", user).await?.status());
    }
    assert_eq!(
        StatusCode::ACCEPTED,
        api.consume("homer", 2, None).await?.status()
    );
    assert_eq!(
        StatusCode::ACCEPTED,
        api.consume("lenny", 1, None).await?.status()
    );

    let rsp = api
        .send(Method::POST, "/org/delete", json!({"org_name": "globex"}))
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    let mut recalls = rsp.json::<Vec<QuotaRecall>>().await?;
    recalls.sort_by(|lhs, rhs| lhs.user_name.cmp(&rhs.user_name));
    assert_eq!(
        vec![("carl1", 0), ("homer", 2), ("lenny", 1)],
        recalls
            .iter()
            .map(|r| (r.user_name.as_ref(), r.quota_debt))
            .collect::<Vec<_>>()
    );

    // Deleting an org that isn't there is not an error
    let rsp = api
        .send(Method::POST, "/org/delete", json!({"org_name": "globex"}))
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    assert!(rsp.json::<Vec<QuotaRecall>>().await?.is_empty());

    // & the name is free again
    assert_eq!(
        StatusCode::CREATED,
        api.create_org("globex", 2).await?.status()
    );
    Ok(())
}
