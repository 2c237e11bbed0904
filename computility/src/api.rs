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

//! # The computility HTTP API
//!
//! Two families of endpoints live under `/v1/computility`:
//!
//! - internal endpoints, called by the other services in the deployment when org membership
//!   changes or spaces start & stop; these are authenticated by the `TOKEN` header
//! - one web endpoint, `GET /account/{compute_type}`, through which a user can look at their own
//!   account; this is authenticated by a bearer JWT
//!
//! All responses are JSON. Failures carry an [ErrorResponseBody].
//!
//! As in the rest of the crate, each handler delegates to a nested function returning a `Result`
//! so that it can use `?`, then converts the outcome to a [Response].

use std::sync::Arc;

use axum::{
    Extension, Router,
    extract::{FromRequest, Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, error};

use crate::{
    authn,
    computility::Computility,
    counter_add,
    entities::{self, Account, ComputeType, SpaceId},
    http::ErrorResponseBody,
    metrics::{self, Sort},
    quota::{self, NewOrg, QuotaRecall, codes},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Bad compute type: {source}"))]
    BadComputeType { source: entities::Error },
    #[snafu(display("Bad request body: {source}"))]
    BadRequestBody { source: JsonRejection },
    #[snafu(display("{source}"))]
    Quota { source: quota::Error },
    #[snafu(display("Authentication failure: {source}"))]
    Unauthorized { source: authn::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, &'static str, String) {
        match self {
            Error::BadComputeType { .. } | Error::BadRequestBody { .. } => (
                StatusCode::BAD_REQUEST,
                codes::BAD_REQUEST_PARAM,
                self.to_string(),
            ),
            Error::Quota { source } => source.as_status_and_msg(),
            // I want to be careful about what sort of information we reveal to our caller...
            Error::Unauthorized { .. } => (
                StatusCode::UNAUTHORIZED,
                codes::UNAUTHORIZED,
                "Unauthorized".to_owned(),
            ),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code, msg) = self.as_status_and_msg();
        (status, ErrorResponseBody::new(code, msg)).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

/// A JSON body extractor whose rejections are ours
///
/// axum's own [Json](axum::Json) rejects malformed bodies with a 422 & a plain-text body; we want
/// a 400 with an [ErrorResponseBody] like every other failure.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(Error))]
struct Json<T>(T);

impl From<JsonRejection> for Error {
    fn from(source: JsonRejection) -> Self {
        Error::BadRequestBody { source }
    }
}

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

fn respond<T: Serialize>(result: Result<T>, status: StatusCode) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(err) => {
            error!("{:#?}", err);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         authentication                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("api.auth.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("api.auth.failures", Sort::IntegralCounter) }

/// Authenticate a request to an internal endpoint
async fn internal_authn(
    State(state): State<Arc<Computility>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    match state.internal_token.check(&headers) {
        Ok(()) => {
            counter_add!(state.instruments, "api.auth.successes", 1, &[]);
            next.run(request).await
        }
        Err(err) => {
            error!("Failed to authenticate an internal request: {err}");
            counter_add!(state.instruments, "api.auth.failures", 1, &[]);
            Error::Unauthorized { source: err }.into_response()
        }
    }
}

/// Authenticate a request to the web endpoint, attaching the caller's [Account] on success
async fn web_authn(
    State(state): State<Arc<Computility>>,
    headers: HeaderMap,
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    match authn::check_bearer(&headers, &state.signing_keys, &state.token_issuer) {
        Ok(user) => {
            debug!("computility authorized user {user}");
            request.extensions_mut().insert(user);
            counter_add!(state.instruments, "api.auth.successes", 1, &[]);
            next.run(request).await
        }
        Err(err) => {
            error!("Failed to authenticate a web request: {err}");
            counter_add!(state.instruments, "api.auth.failures", 1, &[]);
            Error::Unauthorized { source: err }.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           internal                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

const SUCCESS: &str = "success";

/// Org membership change
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReqToUpdateOrgMember {
    pub org_name: Account,
    pub user_name: Account,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReqToDeleteOrg {
    pub org_name: Account,
}

/// Consume or release quota
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReqToChangeQuota {
    pub user_name: Account,
    pub compute_type: ComputeType,
    pub quota_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_id: Option<SpaceId>,
}

/// Move a space's consumption to its successor
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReqToSupplySpace {
    pub user_name: Account,
    pub compute_type: ComputeType,
    pub space_id: SpaceId,
    pub new_space_id: SpaceId,
}

/// `POST /v1/computility/account`
async fn user_join(
    State(state): State<Arc<Computility>>,
    Json(req): Json<ReqToUpdateOrgMember>,
) -> Response {
    async fn user_join1(state: &Computility, req: ReqToUpdateOrgMember) -> Result<&'static str> {
        state
            .service
            .user_join(&req.org_name, &req.user_name)
            .await
            .context(QuotaSnafu)?;
        Ok(SUCCESS)
    }
    respond(user_join1(&state, req).await, StatusCode::CREATED)
}

/// `PUT /v1/computility/account/remove`
async fn user_remove(
    State(state): State<Arc<Computility>>,
    Json(req): Json<ReqToUpdateOrgMember>,
) -> Response {
    async fn user_remove1(state: &Computility, req: ReqToUpdateOrgMember) -> Result<QuotaRecall> {
        let recall = state
            .service
            .user_remove(&req.org_name, &req.user_name)
            .await
            .context(QuotaSnafu)?;
        // The org isn't compute-enabled: nothing was assigned, so nothing is owed
        Ok(recall.unwrap_or_else(|| QuotaRecall {
            user_name: req.user_name,
            records: Vec::new(),
            quota_debt: 0,
        }))
    }
    respond(user_remove1(&state, req).await, StatusCode::ACCEPTED)
}

/// `POST /v1/computility/org/delete`
async fn org_delete(
    State(state): State<Arc<Computility>>,
    Json(req): Json<ReqToDeleteOrg>,
) -> Response {
    let result = state
        .service
        .org_delete(&req.org_name)
        .await
        .context(QuotaSnafu);
    respond(result, StatusCode::CREATED)
}

/// `POST /v1/computility/org`
async fn create_org(State(state): State<Arc<Computility>>, Json(req): Json<NewOrg>) -> Response {
    let result = state.service.create_org(&req).await.context(QuotaSnafu);
    respond(result, StatusCode::CREATED)
}

/// `PUT /v1/computility/account/consume`
async fn consume(
    State(state): State<Arc<Computility>>,
    Json(req): Json<ReqToChangeQuota>,
) -> Response {
    let result = state
        .service
        .user_quota_consume(
            &req.user_name,
            req.compute_type,
            req.quota_count,
            req.space_id.as_ref(),
        )
        .await
        .context(QuotaSnafu)
        .map(|_| SUCCESS);
    respond(result, StatusCode::ACCEPTED)
}

/// `PUT /v1/computility/account/release`
async fn release(
    State(state): State<Arc<Computility>>,
    Json(req): Json<ReqToChangeQuota>,
) -> Response {
    let result = state
        .service
        .user_quota_release(
            &req.user_name,
            req.compute_type,
            req.quota_count,
            req.space_id.as_ref(),
        )
        .await
        .context(QuotaSnafu)
        .map(|_| SUCCESS);
    respond(result, StatusCode::ACCEPTED)
}

/// `PUT /v1/computility/account/supply`
async fn supply(
    State(state): State<Arc<Computility>>,
    Json(req): Json<ReqToSupplySpace>,
) -> Response {
    let result = state
        .service
        .space_create_supply(
            &req.user_name,
            req.compute_type,
            &req.space_id,
            &req.new_space_id,
        )
        .await
        .context(QuotaSnafu)
        .map(|_| SUCCESS);
    respond(result, StatusCode::ACCEPTED)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              web                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `GET /v1/computility/account/{compute_type}`
async fn account_detail(
    State(state): State<Arc<Computility>>,
    Extension(user): Extension<Account>,
    Path(compute_type): Path<String>,
) -> Response {
    async fn account_detail1(
        state: &Computility,
        user: &Account,
        compute_type: &str,
    ) -> Result<quota::AccountQuotaDetail> {
        let compute_type = compute_type
            .parse::<ComputeType>()
            .context(BadComputeTypeSnafu)?;
        state
            .service
            .account_detail(user, compute_type)
            .await
            .context(QuotaSnafu)
    }
    respond(
        account_detail1(&state, &user, &compute_type).await,
        StatusCode::OK,
    )
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a Router for the computility API
///
/// The returned router can be composed with other routers.
pub fn make_router(state: Arc<Computility>) -> Router {
    let internal = Router::new()
        .route("/account", post(user_join))
        .route("/account/remove", put(user_remove))
        .route("/account/consume", put(consume))
        .route("/account/release", put(release))
        .route("/account/supply", put(supply))
        .route("/org", post(create_org))
        .route("/org/delete", post(org_delete))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            internal_authn,
        ));
    let web = Router::new()
        .route("/account/{compute_type}", get(account_detail))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            web_authn,
        ));
    Router::new()
        .nest("/v1/computility", internal.merge(web))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    use axum::body::Body;
    use chrono::Duration;
    use opentelemetry_prometheus_text_exporter::PrometheusExporter;
    use secrecy::SecretString;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::{
        authn::InternalToken,
        background_tasks::{BackgroundTasks, RetryPolicy},
        entities::ComputilityOrg,
        memory::Memory,
        metrics::Instruments,
        quota::{AccountQuotaDetail, QuotaService},
        signing_keys::{KeyId, SigningKey, SigningKeys},
        token::mint_token,
    };

    const TOKEN: &str = "open-sesame";

    fn keys() -> (KeyId, SigningKey) {
        (
            KeyId::new("keyid:20250101").unwrap(),
            SigningKey::new(vec![3; 64]).unwrap(),
        )
    }

    fn router() -> Router {
        let memory = Arc::new(Memory::with_orgs([ComputilityOrg::new(
            Uuid::new_v4(),
            &Account::new("acme-corp").unwrap(),
            ComputeType::Npu,
            3,
        )]));
        let tasks = Arc::new(BackgroundTasks::new(memory.clone(), RetryPolicy::default()));
        let instruments = Arc::new(Instruments::new("computility"));
        let salt: SecretString = "salt".into();
        let hash = InternalToken::hash_token(&salt, TOKEN).unwrap();
        let (keyid, key) = keys();
        make_router(Arc::new(Computility {
            service: QuotaService::new(memory, tasks, instruments.clone()),
            exporter: PrometheusExporter::new(),
            instruments,
            internal_token: InternalToken::new(salt, hash.into()),
            signing_keys: SigningKeys::from([(keyid, key)]),
            token_issuer: "computility".to_owned(),
        }))
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header("TOKEN", token);
        }
        let rsp = router
            .clone()
            .oneshot(builder.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = rsp.status();
        let body = axum::body::to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn get_detail(router: &Router, compute_type: &str, bearer: &str) -> Response {
        router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/v1/computility/account/{compute_type}"))
                    .header("authorization", format!("Bearer {bearer}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    fn member(user: &str) -> serde_json::Value {
        serde_json::json!({"org_name": "acme-corp", "user_name": user})
    }

    fn change(user: &str, quota_count: i64) -> serde_json::Value {
        serde_json::json!({"user_name": user, "compute_type": "npu", "quota_count": quota_count})
    }

    #[tokio::test]
    async fn join_consume_remove() {
        let router = router();
        let (status, body) = call(
            &router,
            "POST",
            "/v1/computility/account",
            Some(TOKEN),
            member("alice"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, serde_json::json!("success"));

        let (status, _) = call(
            &router,
            "PUT",
            "/v1/computility/account/consume",
            Some(TOKEN),
            change("alice", 2),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = call(
            &router,
            "PUT",
            "/v1/computility/account/consume",
            Some(TOKEN),
            change("alice", 2),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "insufficient_quota");

        let (status, body) = call(
            &router,
            "PUT",
            "/v1/computility/account/remove",
            Some(TOKEN),
            member("alice"),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let recall: QuotaRecall = serde_json::from_value(body).unwrap();
        assert_eq!(recall.quota_debt, 2);

        let (status, body) = call(
            &router,
            "PUT",
            "/v1/computility/account/remove",
            Some(TOKEN),
            member("bobby"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn internal_endpoints_want_the_token() {
        let router = router();
        let (status, body) = call(
            &router,
            "POST",
            "/v1/computility/account",
            None,
            member("alice"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");

        let (status, _) = call(
            &router,
            "POST",
            "/v1/computility/account",
            Some("open-sesame!"),
            member("alice"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn validation() {
        let router = router();
        // Not JSON at all
        let rsp = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/computility/account")
                    .header(CONTENT_TYPE, "application/json")
                    .header("TOKEN", TOKEN)
                    .body(Body::from("{"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);

        // A bad account name
        let (status, body) = call(
            &router,
            "POST",
            "/v1/computility/account",
            Some(TOKEN),
            member("not a name"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request_param");

        // A non-positive amount
        let (status, body) = call(
            &router,
            "PUT",
            "/v1/computility/account/consume",
            Some(TOKEN),
            change("alice", 0),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request_param");
    }

    #[tokio::test]
    async fn org_lifecycle() {
        let router = router();
        let (status, body) = call(
            &router,
            "POST",
            "/v1/computility/org",
            Some(TOKEN),
            serde_json::json!({"org_name": "initech", "compute_type": "npu", "default_assign_quota": 5}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["org_name"], "initech");

        let (status, body) = call(
            &router,
            "POST",
            "/v1/computility/org",
            Some(TOKEN),
            serde_json::json!({"org_name": "initech", "compute_type": "npu", "default_assign_quota": 5}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "org_exists");

        call(
            &router,
            "POST",
            "/v1/computility/account",
            Some(TOKEN),
            serde_json::json!({"org_name": "initech", "user_name": "peter"}),
        )
        .await;
        let (status, body) = call(
            &router,
            "POST",
            "/v1/computility/org/delete",
            Some(TOKEN),
            serde_json::json!({"org_name": "initech"}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let recalls: Vec<QuotaRecall> = serde_json::from_value(body).unwrap();
        assert_eq!(recalls.len(), 1);
        assert_eq!(recalls[0].quota_debt, 0);
    }

    #[tokio::test]
    async fn account_detail_wants_a_bearer() {
        let router = router();
        call(
            &router,
            "POST",
            "/v1/computility/account",
            Some(TOKEN),
            member("alice"),
        )
        .await;

        let (keyid, key) = keys();
        let alice = Account::new("alice").unwrap();
        let jwt = mint_token(&alice, &keyid, &key, "computility", &Duration::seconds(60)).unwrap();
        let rsp = get_detail(&router, "npu", &jwt).await;
        assert_eq!(rsp.status(), StatusCode::OK);
        let detail: AccountQuotaDetail =
            serde_json::from_slice(&axum::body::to_bytes(rsp.into_body(), usize::MAX).await.unwrap()).unwrap();
        assert_eq!(
            (detail.total_quota, detail.used_quota, detail.quota_balance),
            (3, 0, 3)
        );

        let rsp = get_detail(&router, "gpu", &jwt).await;
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);

        let rsp = get_detail(&router, "npu", "not.a.token").await;
        assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);

        // Signed by someone else
        let forged = mint_token(
            &alice,
            &keyid,
            &SigningKey::new(vec![4; 64]).unwrap(),
            "computility",
            &Duration::seconds(60),
        )
        .unwrap();
        assert_eq!(
            get_detail(&router, "npu", &forged).await.status(),
            StatusCode::UNAUTHORIZED
        );

        // Bob has no account
        let bob = mint_token(
            &Account::new("bobby").unwrap(),
            &keyid,
            &key,
            "computility",
            &Duration::seconds(60),
        )
        .unwrap();
        assert_eq!(
            get_detail(&router, "npu", &bob).await.status(),
            StatusCode::NOT_FOUND
        );
    }
}
