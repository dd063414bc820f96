//! HTTP surface of the control plane.
//!
//! Authentication is a bearer session key matched against the config
//! record; the record lives on the encrypted volume, so authenticated
//! routes are inherently unavailable while the appliance is locked. The
//! unauthenticated routes (`/login`, `/setup`, `/status`, the locking
//! status, and the reset-code pair) are exactly the ones a still-locked
//! appliance must answer.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use coffer_core::store::random_credential;
use coffer_core::workflow::reset_code_lines;
use coffer_core::{
    expand_disks, factory_reset, gate, initial_setup, lifecycle, AccessStore, CofferError,
    CofferResult, ExpandRequest, LifecycleState, ResetCodes, SecretCache, Session, SetupRequest,
};
use coffer_provider::{DiskDetail, DiskProvider, ScreenLine, StatusScreen};
use coffer_system::{bytes_to_human, MkpasswdVerifier, SystemAccounts, SystemDiskProvider};
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Everything a handler needs, shared across the router.
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<SystemDiskProvider>,
    pub accounts: Arc<SystemAccounts>,
    pub verifier: Arc<MkpasswdVerifier>,
    pub screen: Arc<dyn StatusScreen>,
    pub store: Arc<AccessStore>,
    pub lifecycle: Arc<LifecycleState>,
    pub cache: Arc<SecretCache>,
    pub reset_codes: Arc<ResetCodes>,
    pub serial: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/disks", get(disks))
        .route("/disk-locking-status", get(disk_locking_status))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/setup", post(setup))
        .route("/expand-disks", post(expand))
        .route("/one-time-password", post(one_time_password))
        .route("/sessions", get(sessions))
        .route("/permissions", post(permissions))
        .route("/reset-setup-code", post(reset_setup_code))
        .route("/reset-setup", post(reset_setup))
        .with_state(state)
}

/// JSON error envelope; the status code follows the failure class.
pub struct ApiError(CofferError);

impl From<CofferError> for ApiError {
    fn from(err: CofferError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CofferError::Auth => StatusCode::UNAUTHORIZED,
            CofferError::Locked => StatusCode::LOCKED,
            CofferError::Validation(_) | CofferError::AlreadyComplete => StatusCode::BAD_REQUEST,
            CofferError::Provision(_) => StatusCode::CONFLICT,
            CofferError::Command { .. } | CofferError::InvalidConfig(_) | CofferError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Run provider/store work off the async runtime.
async fn blocking<T, F>(task: F) -> Result<T, ApiError>
where
    F: FnOnce() -> CofferResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| ApiError(CofferError::Io(std::io::Error::other(err))))?
        .map_err(ApiError)
}

fn bearer_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Resolve the caller's session from the bearer key. Fails with `Locked`
/// while the record is unreachable, `Auth` for an unknown key.
fn authenticate(store: &AccessStore, key: Option<&str>) -> CofferResult<Session> {
    let key = key.ok_or(CofferError::Auth)?;
    let config = store.load()?;
    config
        .session_for_key(key)
        .cloned()
        .ok_or(CofferError::Auth)
}

fn require_owner(store: &AccessStore, session: &Session) -> CofferResult<()> {
    if store.load()?.is_owner(&session.user) {
        Ok(())
    } else {
        Err(CofferError::Auth)
    }
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "setupComplete": state.store.paths().setup_complete(),
    }))
}

async fn disk_locking_status(
    State(state): State<AppState>,
) -> Result<Json<lifecycle::PhaseSnapshot>, ApiError> {
    let snapshot = blocking(move || {
        lifecycle::evaluate(
            state.provider.as_ref(),
            state.store.paths(),
            &state.lifecycle,
            state.screen.as_ref(),
        )
    })
    .await?;
    Ok(Json(snapshot))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiskEntry {
    #[serde(flatten)]
    detail: DiskDetail,
    size: String,
}

async fn disks(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let details = blocking(move || state.provider.disk_details()).await?;

    let total: u64 = details.iter().map(|d| d.size_bytes).sum();
    let smallest = details.iter().map(|d| d.size_bytes).min().unwrap_or(0);
    let entries: Vec<DiskEntry> = details
        .into_iter()
        .map(|detail| DiskEntry {
            size: bytes_to_human(detail.size_bytes),
            detail,
        })
        .collect();

    Ok(Json(json!({
        "disks": entries,
        "capacity": {
            "total": bytes_to_human(total),
            "mirrored": bytes_to_human(smallest),
        },
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginBody {
    #[serde(default)]
    user: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    one_time_password: Option<String>,
    #[serde(default)]
    session_key: Option<String>,
    session_name: String,
    platform: String,
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = blocking(move || {
        let key = body.session_key.unwrap_or_else(random_credential);
        match body.one_time_password {
            Some(otp) => gate::login_with_otp(
                &state.store,
                &otp,
                &key,
                &body.session_name,
                &body.platform,
            ),
            None => gate::login(
                state.provider.as_ref(),
                state.verifier.as_ref(),
                &state.store,
                &state.lifecycle,
                &state.cache,
                &gate::LoginRequest {
                    user: body.user,
                    password: body.password,
                    session_key: key,
                    session_name: body.session_name,
                    session_platform: body.platform,
                },
            ),
        }
        .map(|session| {
            let owner = state
                .store
                .paths()
                .read_owner()
                .ok()
                .flatten()
                .is_some_and(|owner| owner == session.user);
            (session, owner)
        })
    })
    .await?;

    let (session, owner) = session;
    Ok(Json(json!({
        "key": session.key,
        "user": session.user,
        "owner": owner,
    })))
}

async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = bearer_key(&headers);
    blocking(move || {
        let session = authenticate(&state.store, key.as_deref())?;
        state.store.remove_session(&session.key)
    })
    .await?;
    Ok(Json(json!({ "message": "logged out" })))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionInfo {
    user: String,
    name: String,
    platform: String,
}

async fn sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    let key = bearer_key(&headers);
    let sessions = blocking(move || {
        let session = authenticate(&state.store, key.as_deref())?;
        require_owner(&state.store, &session)?;
        state.store.sessions()
    })
    .await?;

    // the bearer keys stay server-side
    Ok(Json(
        sessions
            .into_iter()
            .map(|s| SessionInfo {
                user: s.user,
                name: s.name,
                platform: s.platform,
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OtpBody {
    user: String,
}

async fn one_time_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<OtpBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = bearer_key(&headers);
    let otp = blocking(move || {
        let session = authenticate(&state.store, key.as_deref())?;
        require_owner(&state.store, &session)?;
        if body.user.trim().is_empty() {
            return Err(CofferError::Validation("user is required".into()));
        }
        state.store.issue_otp(body.user.trim())
    })
    .await?;

    Ok(Json(json!({
        "oneTimePassword": otp,
        "loginUrl": format!("https://app.coffer.io/otp/{otp}"),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetupBody {
    full_name: String,
    password: String,
    #[serde(default)]
    session_key: Option<String>,
    session_name: String,
    platform: String,
    disks: Vec<String>,
    #[serde(default)]
    mirrored: bool,
}

async fn setup(
    State(state): State<AppState>,
    Json(body): Json<SetupBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = blocking(move || {
        state.screen.render(&[
            ScreenLine::new("Setup In Progress", "3C89C7", 32, 70),
            ScreenLine::new("Please wait", "CCCCCC", 28, 165),
        ]);
        let request = SetupRequest {
            full_name: body.full_name,
            password: body.password,
            session_key: body.session_key.unwrap_or_else(random_credential),
            session_name: body.session_name,
            session_platform: body.platform,
            disks: body.disks,
            mirrored: body.mirrored,
        };
        let key = request.session_key.clone();
        let outcome = initial_setup(
            state.provider.as_ref(),
            state.accounts.as_ref(),
            state.verifier.as_ref(),
            &state.store,
            &state.lifecycle,
            state.serial.as_deref(),
            &request,
        );
        // leave the in-progress screen behind whatever happened
        state
            .screen
            .render(&lifecycle::screen_lines(state.lifecycle.current()));
        let report = outcome?;
        report.log();
        Ok(key)
    })
    .await?;

    Ok(Json(json!({ "message": "setup complete", "key": key })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpandBody {
    disks: Vec<String>,
}

// no bearer check: the appliance sits in NewDisk where the config record
// is unreachable, and the single-use cached secret from the owner login
// is the effective authorization
async fn expand(
    State(state): State<AppState>,
    Json(body): Json<ExpandBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        let report = expand_disks(
            state.provider.as_ref(),
            &state.store,
            &state.lifecycle,
            &state.cache,
            &ExpandRequest { disks: body.disks },
        )?;
        report.log();
        Ok(())
    })
    .await?;

    Ok(Json(json!({ "message": "volume expanded" })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionsBody {
    name: String,
    path: String,
    users: Vec<String>,
}

async fn permissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PermissionsBody>,
) -> Result<Json<coffer_core::Share>, ApiError> {
    let key = bearer_key(&headers);
    let share = blocking(move || {
        let session = authenticate(&state.store, key.as_deref())?;
        require_owner(&state.store, &session)?;
        state
            .store
            .upsert_share(state.accounts.as_ref(), &body.name, &body.path, body.users)
    })
    .await?;
    Ok(Json(share))
}

async fn reset_setup_code(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(move || {
        let code = state.reset_codes.generate()?;
        // the code goes to the physical screen only, never the response
        state.screen.render(&reset_code_lines(&code));
        Ok(())
    })
    .await?;
    Ok(Json(json!({ "message": "reset code displayed on device" })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetBody {
    #[serde(default)]
    confirmed: bool,
    #[serde(default)]
    code: Option<String>,
}

async fn reset_setup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ResetBody>,
) -> Result<Response, ApiError> {
    let key = bearer_key(&headers);
    let report = blocking(move || {
        let owner_authorized = authenticate(&state.store, key.as_deref())
            .and_then(|session| require_owner(&state.store, &session));
        if owner_authorized.is_err() {
            match &body.code {
                Some(code) => state.reset_codes.verify(code)?,
                None => return Err(CofferError::Auth),
            }
        }

        factory_reset(
            state.provider.as_ref(),
            state.accounts.as_ref(),
            &state.store,
            &state.lifecycle,
            &state.cache,
            body.confirmed,
        )
    })
    .await?;

    report.log();
    if report.has_errors() {
        return Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": report.error_summary() })),
        )
            .into_response());
    }
    Ok(Json(json!({ "message": "factory reset complete" })).into_response())
}
