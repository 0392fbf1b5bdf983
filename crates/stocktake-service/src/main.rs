use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stocktake_api::{
    AttachmentList, StocktakeApi, SubmissionHistory, SubmissionList, UserLookup, WriteReceipt,
};
use stocktake_core::{Claims, DeployEnv, FieldError, StocktakeError, SubmissionId};
use stocktake_files::{AttachmentCoordinator, GrantSigner, LocalObjectStore, UploadGrant};
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const SERVICE_NAME: &str = "study-stocktake-api";

/// Trusted identity headers set by the upstream authenticator.
const AUTH_SUB_HEADER: &str = "x-auth-sub";
const AUTH_EMAIL_HEADER: &str = "x-auth-email";

#[derive(Clone)]
struct ServiceState {
    api: Arc<StocktakeApi<LocalObjectStore>>,
}

#[derive(Debug, Parser)]
#[command(name = "stocktake-service")]
#[command(about = "HTTP service for the study stocktake API")]
struct Args {
    #[arg(long, default_value = "./stocktake.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
    #[arg(long, default_value = "./stocktake-files")]
    files_root: PathBuf,
    /// Deployment environment: dev, test, staging, or prod.
    #[arg(long, default_value = "dev")]
    env: String,
    /// 64-char hex grant signing key; a random key is generated when absent.
    #[arg(long)]
    grant_key: Option<String>,
    /// Email domains admitted at signup; empty admits every domain.
    #[arg(long, value_delimiter = ',', num_args = 0..)]
    allowed_domains: Vec<String>,
    /// Public base URL embedded in upload and download grants.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    base_url: String,
}

#[derive(Debug)]
enum ServiceError {
    Domain(StocktakeError),
    BadRequest(String),
}

impl From<StocktakeError> for ServiceError {
    fn from(err: StocktakeError) -> Self {
        Self::Domain(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message, None),
            Self::Domain(StocktakeError::Validation(errors)) => {
                (StatusCode::BAD_REQUEST, "Validation failed".to_string(), Some(errors))
            }
            Self::Domain(StocktakeError::NotFound(message)) => {
                (StatusCode::NOT_FOUND, message, None)
            }
            Self::Domain(StocktakeError::AuthRequired) => {
                (StatusCode::UNAUTHORIZED, "Authentication required".to_string(), None)
            }
            Self::Domain(StocktakeError::Conflict(message)) => {
                (StatusCode::CONFLICT, message, None)
            }
            Self::Domain(StocktakeError::Upstream(message)) => {
                tracing::error!(error = %message, "request failed upstream");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string(), None)
            }
        };
        (status, Json(ErrorBody { error, details })).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

#[derive(Debug, Serialize)]
struct MessageBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest {
    #[serde(default)]
    filename: String,
    #[serde(default)]
    content_type: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupRequest {
    #[serde(default)]
    user_ids: Vec<String>,
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submissions", post(create_submission).get(list_submissions))
        .route("/submissions/all", get(list_all_submissions))
        .route(
            "/submissions/:id",
            get(get_submission).put(update_submission).delete(archive_submission),
        )
        .route("/submissions/:id/restore", post(restore_submission))
        .route("/submissions/:id/history", get(submission_history))
        .route("/submissions/:id/files", post(grant_upload).get(list_files))
        .route("/submissions/:id/files/:filename", delete(delete_file))
        .route("/users/lookup", post(lookup_users))
        .layer(axum::middleware::map_response(with_cors_headers))
        .with_state(state)
}

async fn with_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type,Authorization"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET,POST,PUT,DELETE,OPTIONS"),
    );
    response
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let env = DeployEnv::parse(&args.env)
        .ok_or_else(|| anyhow!("unknown environment: {}", args.env))?;
    std::fs::create_dir_all(&args.files_root)
        .with_context(|| format!("failed to create files root {}", args.files_root.display()))?;

    let signer = match args.grant_key.as_deref() {
        Some(raw) => GrantSigner::from_hex(raw)
            .map_err(|err| anyhow!("invalid --grant-key: {err}"))?,
        None => GrantSigner::random(),
    };
    let attachments = AttachmentCoordinator::new(
        LocalObjectStore::new(args.files_root),
        signer,
        args.base_url,
    );
    let state = ServiceState {
        api: Arc::new(StocktakeApi::new(args.db, env, args.allowed_domains, attachments)),
    };

    tracing::info!(bind = %args.bind, env = env.as_str(), "starting {SERVICE_NAME}");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn claims_from(headers: &HeaderMap) -> Option<Claims> {
    let sub = headers.get(AUTH_SUB_HEADER)?.to_str().ok()?.trim();
    if sub.is_empty() {
        return None;
    }
    let email = headers
        .get(AUTH_EMAIL_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    Some(Claims { sub: sub.to_string(), email })
}

fn body_object(value: Value) -> Result<Map<String, Value>, ServiceError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ServiceError::BadRequest("Invalid JSON in request body".to_string())),
    }
}

fn parse_id(raw: &str) -> Result<SubmissionId, ServiceError> {
    Ulid::from_str(raw).map(SubmissionId).map_err(|_| {
        ServiceError::Domain(StocktakeError::NotFound(format!(
            "No submission found with id {raw}"
        )))
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy", service: SERVICE_NAME })
}

async fn create_submission(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<WriteReceipt>), ServiceError> {
    let claims = claims_from(&headers);
    let body = body_object(body)?;
    let receipt = state.api.create(claims.as_ref(), &body)?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn list_submissions(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<SubmissionList>, ServiceError> {
    let claims = claims_from(&headers);
    let list = state.api.list_mine(claims.as_ref(), query.status.as_deref())?;
    Ok(Json(list))
}

async fn list_all_submissions(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<SubmissionList>, ServiceError> {
    let claims = claims_from(&headers);
    let list = state.api.list_all(claims.as_ref(), query.status.as_deref())?;
    Ok(Json(list))
}

async fn get_submission(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<stocktake_core::SubmissionRecord>, ServiceError> {
    let claims = claims_from(&headers);
    let record = state.api.get_current(claims.as_ref(), parse_id(&id)?)?;
    Ok(Json(record))
}

async fn update_submission(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<WriteReceipt>, ServiceError> {
    let claims = claims_from(&headers);
    let body = body_object(body)?;
    let receipt = state.api.update(claims.as_ref(), parse_id(&id)?, &body)?;
    Ok(Json(receipt))
}

async fn archive_submission(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<WriteReceipt>, ServiceError> {
    let claims = claims_from(&headers);
    let receipt = state.api.archive(claims.as_ref(), parse_id(&id)?)?;
    Ok(Json(receipt))
}

async fn restore_submission(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<WriteReceipt>, ServiceError> {
    let claims = claims_from(&headers);
    let receipt = state.api.restore(claims.as_ref(), parse_id(&id)?)?;
    Ok(Json(receipt))
}

async fn submission_history(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SubmissionHistory>, ServiceError> {
    let claims = claims_from(&headers);
    let history = state.api.history(claims.as_ref(), parse_id(&id)?)?;
    Ok(Json(history))
}

async fn grant_upload(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadGrant>, ServiceError> {
    let claims = claims_from(&headers);
    let grant = state.api.grant_upload(
        claims.as_ref(),
        parse_id(&id)?,
        &request.filename,
        &request.content_type,
    )?;
    Ok(Json(grant))
}

async fn list_files(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<AttachmentList>, ServiceError> {
    let claims = claims_from(&headers);
    let files = state.api.list_files(claims.as_ref(), parse_id(&id)?)?;
    Ok(Json(files))
}

async fn delete_file(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path((id, filename)): Path<(String, String)>,
) -> Result<Json<MessageBody>, ServiceError> {
    let claims = claims_from(&headers);
    let message = state.api.delete_file(claims.as_ref(), parse_id(&id)?, &filename)?;
    Ok(Json(MessageBody { message }))
}

async fn lookup_users(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<LookupRequest>,
) -> Result<Json<UserLookup>, ServiceError> {
    let claims = claims_from(&headers);
    let lookup = state.api.lookup_users(claims.as_ref(), &request.user_ids)?;
    Ok(Json(lookup))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    use super::*;

    fn scratch_state(env: DeployEnv) -> (ServiceState, PathBuf, PathBuf) {
        let suffix = Ulid::new();
        let db_path = std::env::temp_dir().join(format!("stocktake-service-{suffix}.sqlite3"));
        let files_root = std::env::temp_dir().join(format!("stocktake-service-files-{suffix}"));
        if let Err(err) = std::fs::create_dir_all(&files_root) {
            panic!("files root should be creatable: {err}");
        }
        let attachments = AttachmentCoordinator::new(
            LocalObjectStore::new(files_root.clone()),
            GrantSigner::random(),
            "http://127.0.0.1:8080".to_string(),
        );
        let state = ServiceState {
            api: Arc::new(StocktakeApi::new(db_path.clone(), env, Vec::new(), attachments)),
        };
        (state, db_path, files_root)
    }

    fn cleanup(db_path: &PathBuf, files_root: &PathBuf) {
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_dir_all(files_root);
    }

    fn valid_submission_json() -> Value {
        serde_json::json!({
            "studyId": "ST-2024-003",
            "studyTitle": "Foresight stocktake",
            "leadCenter": "Center A",
            "contactName": "R. Researcher",
            "contactEmail": "researcher@cgiar.org",
            "otherCenters": ["Center B"],
            "studyType": "foresight_futures",
            "timing": "t0_ex_ante",
            "analyticalScope": "innovation_technology",
            "geographicScope": "sub_national",
            "resultLevel": "outcome",
            "causalityMode": "c0_descriptive",
            "methodClass": "participatory",
            "primaryIndicator": "Scenario coverage",
            "startDate": "2024-05-01",
            "expectedEndDate": "2024-11-30",
            "dataCollectionStatus": "planned",
            "analysisStatus": "planned",
            "funded": "no",
            "proposalAvailable": {"answer": "no"},
            "manuscriptDeveloped": {"answer": "no"},
            "policyBriefDeveloped": {"answer": "no"},
            "relatedToPastStudy": {"answer": "no"},
            "intendedPrimaryUser": ["iaes"],
            "commissioningSource": "Core budget",
        })
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .uri(uri)
            .method(method)
            .header(AUTH_SUB_HEADER, "user-a")
            .header(AUTH_EMAIL_HEADER, "a@cgiar.org")
            .header("content-type", "application/json");
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        builder.body(body).unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn send(router: Router, req: Request<Body>) -> Response {
        match router.oneshot(req).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    #[tokio::test]
    async fn health_reports_service_identity_with_cors_headers() {
        let (state, db_path, files_root) = scratch_state(DeployEnv::Dev);
        let response = send(app(state), request("GET", "/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").map(HeaderValue::as_bytes),
            Some(b"*".as_slice())
        );
        assert_eq!(
            response.headers().get("access-control-allow-methods").map(HeaderValue::as_bytes),
            Some(b"GET,POST,PUT,DELETE,OPTIONS".as_slice())
        );

        let value = response_json(response).await;
        assert_eq!(value.get("status").and_then(Value::as_str), Some("healthy"));
        assert_eq!(value.get("service").and_then(Value::as_str), Some(SERVICE_NAME));
        cleanup(&db_path, &files_root);
    }

    #[tokio::test]
    async fn create_and_get_round_trip_over_http() {
        let (state, db_path, files_root) = scratch_state(DeployEnv::Dev);
        let router = app(state);

        let created = send(
            router.clone(),
            request("POST", "/submissions", Some(valid_submission_json())),
        )
        .await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let receipt = response_json(created).await;
        assert_eq!(receipt.get("version").and_then(Value::as_u64), Some(1));
        let id = receipt
            .get("submissionId")
            .and_then(Value::as_str)
            .unwrap_or_else(|| panic!("receipt missing submissionId: {receipt}"))
            .to_string();

        let fetched =
            send(router.clone(), request("GET", &format!("/submissions/{id}"), None)).await;
        assert_eq!(fetched.status(), StatusCode::OK);
        let record = response_json(fetched).await;
        assert_eq!(record.get("studyId").and_then(Value::as_str), Some("ST-2024-003"));
        assert_eq!(record.get("status").and_then(Value::as_str), Some("active"));
        assert_eq!(record.get("userId").and_then(Value::as_str), Some("user-a"));

        let listed = send(router, request("GET", "/submissions?status=active", None)).await;
        assert_eq!(listed.status(), StatusCode::OK);
        let list = response_json(listed).await;
        assert_eq!(list.get("count").and_then(Value::as_u64), Some(1));
        cleanup(&db_path, &files_root);
    }

    #[tokio::test]
    async fn invalid_payload_returns_field_details() {
        let (state, db_path, files_root) = scratch_state(DeployEnv::Dev);
        let mut payload = valid_submission_json();
        if let Some(map) = payload.as_object_mut() {
            map.remove("contactEmail");
            map.insert("funded".to_string(), serde_json::json!("maybe"));
        }

        let response = send(app(state), request("POST", "/submissions", Some(payload))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value.get("error").and_then(Value::as_str), Some("Validation failed"));
        let details = value
            .get("details")
            .and_then(Value::as_array)
            .unwrap_or_else(|| panic!("missing details in {value}"));
        assert!(details.iter().any(|detail| {
            detail.get("field").and_then(Value::as_str) == Some("contactEmail")
        }));
        assert!(details.iter().any(|detail| {
            detail.get("field").and_then(Value::as_str) == Some("funded")
        }));
        cleanup(&db_path, &files_root);
    }

    #[tokio::test]
    async fn archive_then_restore_over_http() {
        let (state, db_path, files_root) = scratch_state(DeployEnv::Dev);
        let router = app(state);

        let created = send(
            router.clone(),
            request("POST", "/submissions", Some(valid_submission_json())),
        )
        .await;
        let receipt = response_json(created).await;
        let id = receipt
            .get("submissionId")
            .and_then(Value::as_str)
            .unwrap_or_else(|| panic!("receipt missing submissionId: {receipt}"))
            .to_string();

        let archived =
            send(router.clone(), request("DELETE", &format!("/submissions/{id}"), None)).await;
        assert_eq!(archived.status(), StatusCode::OK);

        let gone = send(router.clone(), request("GET", &format!("/submissions/{id}"), None)).await;
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);

        let restored = send(
            router.clone(),
            request("POST", &format!("/submissions/{id}/restore"), None),
        )
        .await;
        assert_eq!(restored.status(), StatusCode::OK);
        let body = response_json(restored).await;
        assert_eq!(
            body.get("message").and_then(Value::as_str),
            Some("Submission restored successfully")
        );

        let history =
            send(router, request("GET", &format!("/submissions/{id}/history"), None)).await;
        assert_eq!(history.status(), StatusCode::OK);
        let history = response_json(history).await;
        assert_eq!(history.get("count").and_then(Value::as_u64), Some(1));
        cleanup(&db_path, &files_root);
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized_in_prod() {
        let (state, db_path, files_root) = scratch_state(DeployEnv::Prod);
        let req = Request::builder()
            .uri("/submissions")
            .method("GET")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(app(state), req).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let value = response_json(response).await;
        assert_eq!(
            value.get("error").and_then(Value::as_str),
            Some("Authentication required")
        );
        cleanup(&db_path, &files_root);
    }

    #[tokio::test]
    async fn unknown_submission_is_not_found() {
        let (state, db_path, files_root) = scratch_state(DeployEnv::Dev);
        let id = Ulid::new();
        let response =
            send(app(state), request("GET", &format!("/submissions/{id}"), None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        cleanup(&db_path, &files_root);
    }

    #[tokio::test]
    async fn user_lookup_rejects_empty_id_list() {
        let (state, db_path, files_root) = scratch_state(DeployEnv::Dev);
        let response = send(
            app(state),
            request("POST", "/users/lookup", Some(serde_json::json!({"userIds": []}))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value.get("error").and_then(Value::as_str), Some("Validation failed"));
        cleanup(&db_path, &files_root);
    }

    #[tokio::test]
    async fn upload_grant_validates_content_type_over_http() {
        let (state, db_path, files_root) = scratch_state(DeployEnv::Dev);
        let router = app(state);

        let created = send(
            router.clone(),
            request("POST", "/submissions", Some(valid_submission_json())),
        )
        .await;
        let receipt = response_json(created).await;
        let id = receipt
            .get("submissionId")
            .and_then(Value::as_str)
            .unwrap_or_else(|| panic!("receipt missing submissionId: {receipt}"))
            .to_string();

        let granted = send(
            router.clone(),
            request(
                "POST",
                &format!("/submissions/{id}/files"),
                Some(serde_json::json!({"filename": "report.pdf", "contentType": "application/pdf"})),
            ),
        )
        .await;
        assert_eq!(granted.status(), StatusCode::OK);
        let grant = response_json(granted).await;
        assert_eq!(grant.get("filename").and_then(Value::as_str), Some("report.pdf"));
        assert!(grant
            .get("uploadUrl")
            .and_then(Value::as_str)
            .is_some_and(|url| url.contains("verb=put")));

        let rejected = send(
            router,
            request(
                "POST",
                &format!("/submissions/{id}/files"),
                Some(serde_json::json!({"filename": "x.bin", "contentType": "application/zip"})),
            ),
        )
        .await;
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
        cleanup(&db_path, &files_root);
    }
}
