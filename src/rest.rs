//! HTTP API for the website builder (axum).
//!
//! Every handler follows the same shape: read the session cookie, make one or
//! two calls through a vendor client, answer with JSON or a streamed text body.
//! Failures are logged here and rendered by `AppError`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{error, info, warn};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::{self, authorize_url, clear_session, session_cookie, session_token};
use crate::billing::{self, CheckoutRequest, WebhookEvent};
use crate::error::{AppError, AppResult, UiHint};
use crate::hosting::{self, SiteFile};
use crate::inference::{self, ChatRequest};
use crate::models::{FeedbackEntry, Tier, UsageSummary, UserInfo, UserRecord};
use crate::providers::{self, Selection};
use crate::rate_limit::client_ip;
use crate::state::AppState;

const MISSING_FIELDS: &str = "Missing required fields";

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AskAiRequest {
    pub prompt: Option<String>,
    pub html: Option<String>,
    pub previous_prompt: Option<String>,
    /// Provider id or `auto`.
    pub provider: Option<String>,
}

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssistantRequest {
    pub prompt: Option<String>,
    pub html: Option<String>,
    pub feedback: Option<String>,
    pub previous_solution: Option<String>,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct FeedbackRequest {
    pub feedback: Option<String>,
    pub solution: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct DeployRequest {
    pub html: Option<String>,
    pub title: Option<String>,
    /// Existing `user/repo` to update; omitted for a new site.
    pub path: Option<String>,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct DeployResponse {
    pub ok: bool,
    pub path: String,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct RemixResponse {
    pub ok: bool,
    pub html: String,
}

#[derive(Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
}

#[derive(Deserialize, Serialize, Default, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutBody {
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
    pub price_id: Option<String>,
    pub tier: Option<String>,
}

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Deserialize, Serialize, Default, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortalBody {
    pub return_url: Option<String>,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct PortalResponse {
    pub url: String,
}

#[derive(Deserialize, Serialize, Debug, PartialEq, ToSchema)]
pub struct SubscriptionView {
    pub status: String,
    pub tier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Unix seconds, as reported by the payment provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_at_period_end: Option<bool>,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct SubscriptionResponse {
    pub subscription: Option<SubscriptionView>,
}

fn required(field: Option<String>) -> AppResult<String> {
    field
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::bad_request(MISSING_FIELDS))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(
        login_handler,
        callback_handler,
        me_handler,
        logout_handler,
        ask_ai_handler,
        ai_assistant_handler,
        ai_feedback_handler,
        recent_feedback_handler,
        deploy_handler,
        remix_handler,
        usage_handler,
        subscription_handler,
        create_checkout_handler,
        create_portal_handler,
        stripe_webhook_handler,
        health_handler,
    ),
    components(schemas(
        AskAiRequest,
        AssistantRequest,
        FeedbackRequest,
        DeployRequest,
        DeployResponse,
        RemixResponse,
        CheckoutBody,
        CheckoutResponse,
        PortalBody,
        PortalResponse,
        SubscriptionView,
        SubscriptionResponse,
        UsageSummary,
        Tier,
        UserInfo,
        FeedbackEntry,
    )),
    tags((name = "ily", description = "AI website builder API"))
)]
pub struct ApiDoc;

/// Cookie presence gate for routes that always need a signed-in caller.
async fn require_session(jar: CookieJar, req: Request, next: Next) -> Result<Response, AppError> {
    if session_token(&jar).is_none() {
        return Err(AppError::unauthorized("Authentication required"));
    }
    Ok(next.run(req).await)
}

fn cors_layer(app_url: &str) -> CorsLayer {
    let origin = HeaderValue::from_str(app_url).unwrap_or_else(|_| HeaderValue::from_static("http://localhost:3000"));
    CorsLayer::new()
        .allow_credentials(true)
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::DELETE, Method::PATCH, Method::POST, Method::PUT])
        .allow_headers([
            HeaderName::from_static("x-csrf-token"),
            HeaderName::from_static("x-requested-with"),
            header::ACCEPT,
            HeaderName::from_static("accept-version"),
            header::CONTENT_LENGTH,
            HeaderName::from_static("content-md5"),
            header::CONTENT_TYPE,
            header::DATE,
            HeaderName::from_static("x-api-version"),
        ])
        .max_age(Duration::from_secs(60 * 60))
}

/// Build the full router over `state`.
pub fn create_router(state: Arc<AppState>) -> Router {
    let session_routes = Router::new()
        .route("/api/deploy", post(deploy_handler))
        .route("/api/ai-feedback", post(ai_feedback_handler))
        .route("/api/ai-feedback/recent", get(recent_feedback_handler))
        .route_layer(middleware::from_fn(require_session));

    let mut router = Router::new()
        .route("/api/auth/login", get(login_handler))
        .route("/api/auth/callback", get(callback_handler))
        .route("/api/auth/me", get(me_handler))
        .route("/api/auth/logout", post(logout_handler))
        .route("/api/ask-ai", post(ask_ai_handler))
        .route("/api/ai-assistant", post(ai_assistant_handler))
        .route("/api/remix/*slug", get(remix_handler))
        .route("/api/user/usage", get(usage_handler))
        .route("/api/user/subscription", get(subscription_handler))
        .route("/api/stripe/create-checkout", post(create_checkout_handler))
        .route("/api/stripe/create-portal", post(create_portal_handler))
        .route("/api/stripe/webhook", post(stripe_webhook_handler))
        .route("/health", get(health_handler))
        .route("/robots.txt", get(robots_handler))
        .route("/sitemap.xml", get(sitemap_handler))
        .route("/manifest.webmanifest", get(manifest_handler))
        .merge(session_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    if let Some(dir) = state.config.static_dir.clone() {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(cors_layer(&state.config.app_url))
        .with_state(state)
}

/// Resolve the session cookie to a user, or 401.
async fn current_user(state: &AppState, jar: &CookieJar) -> AppResult<(String, UserInfo)> {
    let token = session_token(jar).ok_or_else(|| AppError::unauthorized("Authentication required"))?;
    let info = state
        .identity
        .userinfo(&token)
        .await?
        .ok_or_else(|| AppError::unauthorized("Failed to get user info"))?;
    Ok((token, info))
}

fn user_id(info: &UserInfo) -> AppResult<String> {
    info.user_id()
        .map(str::to_string)
        .ok_or_else(|| AppError::unauthorized("Failed to get user info"))
}

/// Log a handler failure at the boundary and pass it on.
fn logged(context: &'static str) -> impl Fn(AppError) -> AppError {
    move |e| {
        if e.status().is_server_error() {
            error!(error = %e, "{context} error");
        } else {
            warn!(error = %e, "{context} rejected");
        }
        e
    }
}

fn streamed_text(rx: inference::BodyReceiver) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(inference::receiver_stream(rx)),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Redirect to the identity provider's consent page.
#[utoipa::path(get, path = "/api/auth/login", tag = "ily",
    responses((status = 307, description = "Redirect to the identity provider"),
              (status = 500, description = "OAuth client not configured")))]
async fn login_handler(State(state): State<Arc<AppState>>) -> AppResult<Redirect> {
    let oauth = &state.config.oauth;
    let client_id = oauth
        .client_id
        .as_deref()
        .ok_or(AppError::NotConfigured("OAuth client ID"))?;
    let csrf = auth::create_state(&oauth.state_secret)
        .map_err(|e| AppError::Internal(format!("State signing failed: {e}")))?;
    let url = authorize_url(state.identity.base_url(), oauth, client_id, &csrf)?;
    Ok(Redirect::temporary(url.as_str()))
}

/// OAuth redirect target: exchange the code and set the session cookie.
#[utoipa::path(get, path = "/api/auth/callback", tag = "ily",
    params(("code" = Option<String>, Query, description = "Authorization code"),
           ("state" = Option<String>, Query, description = "Signed state from the login redirect")),
    responses((status = 303, description = "Back to the app, with `?error=` on failure")))]
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> (CookieJar, Redirect) {
    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        return (jar, Redirect::to("/"));
    };
    let oauth = &state.config.oauth;
    let (Some(client_id), Some(client_secret)) = (oauth.client_id.as_deref(), oauth.client_secret.as_deref()) else {
        error!("OAuth credentials not configured");
        return (jar, Redirect::to("/?error=oauth_config"));
    };
    let state_ok = params
        .state
        .as_deref()
        .map_or(false, |s| auth::validate_state(s, &oauth.state_secret).is_ok());
    if !state_ok {
        warn!("OAuth callback with invalid state");
        return (jar, Redirect::to("/?error=invalid_state"));
    }

    let token = match state
        .identity
        .exchange_code(&code, client_id, client_secret, &oauth.redirect_uri)
        .await
    {
        Ok(Some(token)) => token,
        Ok(None) => return (jar, Redirect::to("/?error=no_token")),
        Err(e) => {
            error!(error = %e, "Auth error");
            return (jar, Redirect::to("/?error=auth_failed"));
        }
    };

    // Best effort: the users row lets billing find this account later.
    match state.identity.userinfo(&token).await {
        Ok(Some(info)) => {
            if let Some(id) = info.user_id() {
                let record = UserRecord {
                    id: id.to_string(),
                    email: info.email.clone(),
                    ..Default::default()
                };
                if let Err(e) = state.db.upsert_user(record).await {
                    warn!(error = %e, "Failed to upsert user");
                }
            }
        }
        Ok(None) => warn!("Fresh token rejected by userinfo"),
        Err(e) => warn!(error = %e, "userinfo lookup failed"),
    }

    let jar = jar.add(session_cookie(token, state.config.is_production));
    (jar, Redirect::to("/"))
}

/// Current user's profile.
#[utoipa::path(get, path = "/api/auth/me", tag = "ily",
    responses((status = 200, body = UserInfo), (status = 401, description = "No or invalid session")))]
async fn me_handler(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let Some(token) = session_token(&jar) else {
        return AppError::unauthorized("Unauthorized").into_response();
    };
    match state.identity.userinfo(&token).await {
        Ok(Some(info)) => (
            [(header::CACHE_CONTROL, "private, max-age=60, stale-while-revalidate=300")],
            Json(info),
        )
            .into_response(),
        Ok(None) => (clear_session(jar), AppError::unauthorized("Invalid token")).into_response(),
        Err(e) => {
            error!(error = %e, "userinfo failed");
            (clear_session(jar), AppError::unauthorized("Authentication failed")).into_response()
        }
    }
}

#[utoipa::path(post, path = "/api/auth/logout", tag = "ily",
    responses((status = 200, description = "Session cookie cleared")))]
async fn logout_handler(jar: CookieJar) -> impl IntoResponse {
    (clear_session(jar), Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// AI
// ---------------------------------------------------------------------------

/// Stream a generated single-file site.
#[utoipa::path(post, path = "/api/ask-ai", tag = "ily", request_body = AskAiRequest,
    responses((status = 200, description = "Streamed HTML", content_type = "text/plain"),
              (status = 400, description = "Missing prompt or context too long"),
              (status = 402, description = "Usage limit reached"),
              (status = 429, description = "Anonymous limit reached")))]
async fn ask_ai_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(payload): Json<AskAiRequest>,
) -> AppResult<Response> {
    ask_ai(&state, &jar, &headers, payload)
        .await
        .map_err(logged("ask-ai"))
}

async fn ask_ai(state: &AppState, jar: &CookieJar, headers: &HeaderMap, payload: AskAiRequest) -> AppResult<Response> {
    let prompt = required(payload.prompt)?;

    let (token, metered_user) = match session_token(jar) {
        Some(token) => {
            let info = state
                .identity
                .userinfo(&token)
                .await?
                .ok_or_else(|| AppError::rejected(StatusCode::UNAUTHORIZED, UiHint::OpenLogin, "Invalid token"))?;
            let user_id = user_id(&info)?;
            let guard = state.metering.lock(&user_id).await;
            let usage = billing::usage_summary(state.db.as_ref(), &user_id).await?;
            if usage.used >= usage.limit {
                return Err(AppError::rejected(
                    StatusCode::PAYMENT_REQUIRED,
                    UiHint::OpenPaywall,
                    format!("You have used {} of {} requests on the {} plan", usage.used, usage.limit, usage.tier.as_str()),
                ));
            }
            (token, Some((user_id, guard)))
        }
        None => {
            let ip = client_ip(headers);
            if !state.rate_limiter.check(&ip) {
                return Err(AppError::rejected(
                    StatusCode::TOO_MANY_REQUESTS,
                    UiHint::OpenLogin,
                    "Log In to continue using the service",
                ));
            }
            let token = state
                .config
                .default_hf_token
                .clone()
                .ok_or(AppError::NotConfigured("Default HF token"))?;
            (token, None)
        }
    };

    let html = payload.html.as_deref();
    let previous = payload.previous_prompt.as_deref();
    let tokens = providers::estimate_tokens(&prompt, previous, html);
    let provider = match providers::select(payload.provider.as_deref(), tokens) {
        Selection::Use(provider) => provider,
        Selection::ContextTooLong(provider) => {
            return Err(AppError::rejected(
                StatusCode::BAD_REQUEST,
                UiHint::OpenSelectProvider,
                format!("Context is too long. {} allow {} max tokens.", provider.name, provider.max_tokens),
            ));
        }
    };

    let request = ChatRequest {
        api_key: token,
        model: format!("{}:{}", inference::GENERATION_MODEL, provider.id),
        messages: inference::generation_messages(&prompt, previous, html),
        max_tokens: providers::request_max_tokens(provider),
    };
    let upstream = state.generator.stream_chat(request).await?;
    info!(provider = provider.id, tokens, "generation started");

    if let Some((user_id, _guard)) = metered_user {
        if let Err(e) = state.db.record_usage(&user_id).await {
            warn!(error = %e, user_id = %user_id, "Failed to record usage");
        }
    }

    Ok(streamed_text(inference::spawn_pump(upstream, true)))
}

/// Stream a coaching answer about the current code.
#[utoipa::path(post, path = "/api/ai-assistant", tag = "ily", request_body = AssistantRequest,
    responses((status = 200, description = "Streamed answer", content_type = "text/plain"),
              (status = 400, description = "Missing prompt or html")))]
async fn ai_assistant_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AssistantRequest>,
) -> AppResult<Response> {
    ai_assistant(&state, payload).await.map_err(logged("ai-assistant"))
}

async fn ai_assistant(state: &AppState, payload: AssistantRequest) -> AppResult<Response> {
    let prompt = required(payload.prompt)?;
    let html = required(payload.html)?;
    let api_key = state
        .config
        .deepseek_api_key
        .clone()
        .ok_or(AppError::NotConfigured("DeepSeek API key"))?;

    let request = ChatRequest {
        api_key,
        model: inference::ASSISTANT_MODEL.to_string(),
        messages: inference::assistant_messages(
            &prompt,
            &html,
            payload.feedback.as_deref(),
            payload.previous_solution.as_deref(),
        ),
        max_tokens: None,
    };
    let upstream = state.assistant.stream_chat(request).await?;
    Ok(streamed_text(inference::spawn_pump(upstream, false)))
}

/// Record feedback on an assistant answer.
#[utoipa::path(post, path = "/api/ai-feedback", tag = "ily", request_body = FeedbackRequest,
    responses((status = 200, description = "`{success: true}`"), (status = 400, description = "Missing fields")))]
async fn ai_feedback_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(payload): Json<FeedbackRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let (Some(feedback), Some(solution), Some(prompt)) = (
        payload.feedback.filter(|v| !v.is_empty()),
        payload.solution.filter(|v| !v.is_empty()),
        payload.prompt.filter(|v| !v.is_empty()),
    ) else {
        return Err(logged("ai-feedback")(AppError::bad_request(MISSING_FIELDS)));
    };

    let mut username = "anonymous".to_string();
    if let Some(token) = session_token(&jar) {
        match state.identity.userinfo(&token).await {
            Ok(Some(info)) => {
                if let Some(name) = info.display_name() {
                    username = name.to_string();
                }
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "Failed to get user info"),
        }
    }

    let entry = FeedbackEntry {
        timestamp: Utc::now(),
        username,
        prompt,
        solution,
        feedback,
    };
    info!(
        username = %entry.username,
        prompt = %entry.prompt,
        feedback = %entry.feedback,
        "assistant feedback"
    );
    state
        .feedback
        .insert(&entry)
        .map_err(|e| logged("ai-feedback")(AppError::Internal(format!("Failed to save feedback: {e}"))))?;

    Ok(Json(json!({ "success": true })))
}

/// Latest feedback entries, newest first.
#[utoipa::path(get, path = "/api/ai-feedback/recent", tag = "ily",
    params(("limit" = Option<usize>, Query, description = "Maximum entries (default 20)")),
    responses((status = 200, body = [FeedbackEntry]), (status = 401, description = "Authentication required")))]
async fn recent_feedback_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<RecentQuery>,
) -> AppResult<Json<Vec<FeedbackEntry>>> {
    current_user(&state, &jar).await.map_err(logged("ai-feedback"))?;
    let limit = query.limit.unwrap_or(20).min(500);
    Ok(Json(state.feedback.recent(limit)?))
}

// ---------------------------------------------------------------------------
// Hosting
// ---------------------------------------------------------------------------

/// Publish the site to a static space (new or existing).
#[utoipa::path(post, path = "/api/deploy", tag = "ily", request_body = DeployRequest,
    responses((status = 200, body = DeployResponse),
              (status = 400, description = "Missing fields"),
              (status = 401, description = "Authentication required")))]
async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(payload): Json<DeployRequest>,
) -> AppResult<Json<DeployResponse>> {
    deploy(&state, &jar, payload).await.map_err(logged("deploy"))
}

async fn deploy(state: &AppState, jar: &CookieJar, payload: DeployRequest) -> AppResult<Json<DeployResponse>> {
    let html = required(payload.html)?;
    let title = required(payload.title)?;
    let token = session_token(jar).ok_or_else(|| AppError::unauthorized("Authentication required"))?;

    let (repo_id, files) = match payload.path.filter(|p| !p.is_empty()) {
        Some(repo_id) => {
            let files = vec![SiteFile::new("index.html", html)];
            (repo_id, files)
        }
        None => {
            let username = state.hosting.whoami(&token).await?;
            let slug = hosting::slugify(&title);
            if slug.is_empty() {
                return Err(AppError::bad_request("Title must contain letters or digits"));
            }
            let repo_id = format!("{username}/{slug}");
            let tagged = hosting::inject_attribution(&html, &state.config.app_url, &repo_id);

            state.hosting.create_space(&token, &repo_id).await?;
            let files = vec![
                SiteFile::new("index.html", tagged),
                SiteFile::new("README.md", hosting::space_readme(&slug)),
            ];
            (repo_id, files)
        }
    };

    state.hosting.upload_files(&token, &repo_id, files).await?;
    info!(repo_id = %repo_id, "site deployed");
    Ok(Json(DeployResponse { ok: true, path: repo_id }))
}

/// Load a deployed site back into the editor.
#[utoipa::path(get, path = "/api/remix/{slug}", tag = "ily",
    params(("slug" = String, Path, description = "`user/repo` of the space")),
    responses((status = 200, body = RemixResponse),
              (status = 400, description = "Invalid remix path"),
              (status = 404, description = "Space or content not found")))]
async fn remix_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> AppResult<Json<RemixResponse>> {
    remix(&state, &slug).await.map_err(logged("remix"))
}

async fn remix(state: &AppState, slug: &str) -> AppResult<Json<RemixResponse>> {
    let segments: Vec<&str> = slug.split('/').filter(|s| !s.is_empty()).collect();
    let [username, repo, ..] = segments.as_slice() else {
        return Err(AppError::bad_request("Invalid remix path"));
    };
    let repo_id = format!("{username}/{repo}");

    let space = state.hosting.space_info(&repo_id).await?;
    if !space.as_ref().is_some_and(|s| s.is_remixable()) {
        return Err(AppError::not_found("Space not found"));
    }
    let html = state
        .hosting
        .fetch_index(&repo_id)
        .await?
        .ok_or_else(|| AppError::not_found("Space content not found"))?;

    Ok(Json(RemixResponse {
        ok: true,
        html: hosting::strip_attribution(&html, &state.config.app_url, &repo_id),
    }))
}

// ---------------------------------------------------------------------------
// Billing
// ---------------------------------------------------------------------------

/// Requests used against the caller's tier limit.
#[utoipa::path(get, path = "/api/user/usage", tag = "ily",
    responses((status = 200, body = UsageSummary), (status = 401, description = "Authentication required")))]
async fn usage_handler(State(state): State<Arc<AppState>>, jar: CookieJar) -> AppResult<Json<UsageSummary>> {
    usage(&state, &jar).await.map(Json).map_err(logged("usage"))
}

async fn usage(state: &AppState, jar: &CookieJar) -> AppResult<UsageSummary> {
    let (_, info) = current_user(state, jar).await?;
    billing::usage_summary(state.db.as_ref(), &user_id(&info)?).await
}

/// Subscription state for the billing page.
#[utoipa::path(get, path = "/api/user/subscription", tag = "ily",
    responses((status = 200, body = SubscriptionResponse), (status = 401, description = "Authentication required")))]
async fn subscription_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> AppResult<Json<SubscriptionResponse>> {
    subscription(&state, &jar).await.map_err(logged("subscription"))
}

async fn subscription(state: &AppState, jar: &CookieJar) -> AppResult<Json<SubscriptionResponse>> {
    let (_, info) = current_user(state, jar).await?;
    let user_id = user_id(&info)?;
    let Some(user) = state.db.find_user(&user_id).await? else {
        return Ok(Json(SubscriptionResponse { subscription: None }));
    };

    let mut view = SubscriptionView {
        status: user.subscription_status.unwrap_or_else(|| "inactive".to_string()),
        tier: user.subscription_tier.unwrap_or_else(|| Tier::Free.as_str().to_string()),
        id: None,
        current_period_start: None,
        current_period_end: None,
        cancel_at_period_end: None,
    };
    if let (Some(customer), Some(payments)) = (user.stripe_customer_id.as_deref(), state.payments.as_ref()) {
        if let Some(sub) = payments.latest_subscription(customer).await? {
            view.id = Some(sub.id);
            view.current_period_start = sub.current_period_start;
            view.current_period_end = sub.current_period_end;
            view.cancel_at_period_end = Some(sub.cancel_at_period_end);
        }
    }
    Ok(Json(SubscriptionResponse { subscription: Some(view) }))
}

/// Start a one-time checkout for a paid tier.
#[utoipa::path(post, path = "/api/stripe/create-checkout", tag = "ily", request_body = CheckoutBody,
    responses((status = 200, body = CheckoutResponse), (status = 401, description = "Authentication required")))]
async fn create_checkout_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<CheckoutBody>,
) -> AppResult<Json<CheckoutResponse>> {
    create_checkout(&state, &jar, body).await.map_err(logged("checkout"))
}

async fn create_checkout(state: &AppState, jar: &CookieJar, body: CheckoutBody) -> AppResult<Json<CheckoutResponse>> {
    let (_, info) = current_user(state, jar).await?;
    let user_id = user_id(&info)?;
    let payments = state.payments.as_ref().ok_or(AppError::NotConfigured("Stripe"))?;
    let price_id = body
        .price_id
        .filter(|p| !p.is_empty())
        .or_else(|| state.config.stripe.premium_price_id.clone())
        .ok_or(AppError::NotConfigured("Price ID"))?;

    let app_url = &state.config.app_url;
    let session = payments
        .create_checkout(CheckoutRequest {
            price_id,
            customer_email: info.email.clone(),
            success_url: body
                .success_url
                .unwrap_or_else(|| format!("{app_url}/payment/success?session_id={{CHECKOUT_SESSION_ID}}")),
            cancel_url: body
                .cancel_url
                .unwrap_or_else(|| format!("{app_url}/payment/canceled")),
            user_id,
            tier: body
                .tier
                .unwrap_or_else(|| state.config.stripe.default_tier.as_str().to_string()),
        })
        .await?;
    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}

/// Open the payment provider's customer portal.
#[utoipa::path(post, path = "/api/stripe/create-portal", tag = "ily", request_body = PortalBody,
    responses((status = 200, body = PortalResponse), (status = 404, description = "No subscription found")))]
async fn create_portal_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<PortalBody>,
) -> AppResult<Json<PortalResponse>> {
    create_portal(&state, &jar, body).await.map_err(logged("portal"))
}

async fn create_portal(state: &AppState, jar: &CookieJar, body: PortalBody) -> AppResult<Json<PortalResponse>> {
    let (_, info) = current_user(state, jar).await?;
    let user_id = user_id(&info)?;
    let payments = state.payments.as_ref().ok_or(AppError::NotConfigured("Stripe"))?;
    let customer = state
        .db
        .find_user(&user_id)
        .await?
        .and_then(|u| u.stripe_customer_id)
        .ok_or_else(|| AppError::not_found("No subscription found"))?;

    let return_url = body
        .return_url
        .unwrap_or_else(|| format!("{}/account", state.config.app_url));
    let session = payments.create_portal(&customer, &return_url).await?;
    Ok(Json(PortalResponse { url: session.url }))
}

/// Payment-provider webhook. The body is verified against its signature
/// before anything is read from it.
#[utoipa::path(post, path = "/api/stripe/webhook", tag = "ily",
    responses((status = 200, description = "`{received: true}`"), (status = 400, description = "Bad signature")))]
async fn stripe_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> AppResult<Json<serde_json::Value>> {
    let signature = headers.get("stripe-signature").and_then(|v| v.to_str().ok());
    let (Some(signature), Some(secret)) = (signature, state.config.stripe.webhook_secret.as_deref()) else {
        return Err(logged("webhook")(AppError::bad_request("Missing signature or webhook secret")));
    };

    billing::verify_signature(&body, signature, secret, Utc::now().timestamp())
        .map_err(|e| logged("webhook")(AppError::bad_request(e.to_string())))?;
    let event: WebhookEvent = serde_json::from_str(&body)
        .map_err(|e| logged("webhook")(AppError::bad_request(format!("Invalid event: {e}"))))?;

    let kind = event.kind.clone();
    match billing::handle_event(state.db.as_ref(), event, state.config.stripe.default_tier, Utc::now()).await {
        Ok(outcome) => info!(event = %kind, ?outcome, "webhook processed"),
        Err(e) => error!(event = %kind, error = %e, "Error updating subscription"),
    }
    Ok(Json(json!({ "received": true })))
}

// ---------------------------------------------------------------------------
// Site metadata
// ---------------------------------------------------------------------------

#[utoipa::path(get, path = "/health", tag = "ily", responses((status = 200, description = "Service is up")))]
async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "service": "ily_server" }))
}

async fn robots_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = format!(
        "User-Agent: *\nAllow: /\nDisallow: /api/\nDisallow: /private/\n\nSitemap: {}/sitemap.xml\n",
        state.config.app_url
    );
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body)
}

async fn sitemap_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n<url>\n<loc>{}</loc>\n<lastmod>{}</lastmod>\n<changefreq>weekly</changefreq>\n<priority>1</priority>\n</url>\n</urlset>\n",
        state.config.app_url,
        Utc::now().to_rfc3339()
    );
    ([(header::CONTENT_TYPE, "application/xml")], body)
}

async fn manifest_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/manifest+json")],
        Json(json!({
            "name": "iLy.quest",
            "short_name": "iLy",
            "description": "Build websites with AI, no code required.",
            "start_url": "/",
            "display": "standalone",
            "background_color": "#ffffff",
            "theme_color": "#EC4899",
            "icons": [
                { "src": "/favicon.ico", "sizes": "any", "type": "image/x-icon" },
                { "src": "/iLy.svg", "sizes": "any", "type": "image/svg+xml" }
            ]
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::IdentityProvider;
    use crate::config::Config;
    use crate::database::{Database, MemoryDatabase};
    use crate::feedback::FeedbackStore;
    use crate::hosting::{HostingProvider, SpaceInfo};
    use crate::inference::{ChatCompletionsClient, InferenceClient, TextStream};
    use crate::rate_limit::{IpRateLimiter, MeterLocks};
    use async_trait::async_trait;
    use axum::http::Request;
    use futures::StreamExt;
    use std::sync::Mutex;
    use tower::ServiceExt; // For .oneshot() testing

    struct FakeIdentity;

    #[async_trait]
    impl IdentityProvider for FakeIdentity {
        fn base_url(&self) -> &str {
            "https://id.example"
        }

        async fn exchange_code(&self, code: &str, _: &str, _: &str, _: &str) -> AppResult<Option<String>> {
            Ok((code == "valid-code").then(|| "good-token".to_string()))
        }

        async fn userinfo(&self, token: &str) -> AppResult<Option<UserInfo>> {
            Ok((token == "good-token").then(|| UserInfo {
                sub: Some("user-1".into()),
                preferred_username: Some("alice".into()),
                email: Some("alice@example.com".into()),
                ..Default::default()
            }))
        }
    }

    #[derive(Default)]
    struct FakeInference {
        last: Mutex<Option<ChatRequest>>,
    }

    #[async_trait]
    impl InferenceClient for FakeInference {
        async fn stream_chat(&self, request: ChatRequest) -> AppResult<TextStream> {
            *self.last.lock().unwrap() = Some(request);
            let chunks = ["Sure!\n", "<!DOCTYPE html><html><body>", "Hi</body></ht", "ml> trailing"];
            Ok(futures::stream::iter(chunks.map(|c| Ok(c.to_string()))).boxed())
        }
    }

    struct NoHosting;

    #[async_trait]
    impl HostingProvider for NoHosting {
        async fn whoami(&self, _: &str) -> AppResult<String> {
            Err(AppError::Upstream("offline".into()))
        }
        async fn create_space(&self, _: &str, _: &str) -> AppResult<()> {
            Err(AppError::Upstream("offline".into()))
        }
        async fn upload_files(&self, _: &str, _: &str, _: Vec<SiteFile>) -> AppResult<()> {
            Err(AppError::Upstream("offline".into()))
        }
        async fn space_info(&self, _: &str) -> AppResult<Option<SpaceInfo>> {
            Ok(None)
        }
        async fn fetch_index(&self, _: &str) -> AppResult<Option<String>> {
            Ok(None)
        }
    }

    struct Harness {
        app: Router,
        db: Arc<MemoryDatabase>,
        generator: Arc<FakeInference>,
    }

    fn test_config() -> Config {
        Config::for_tests(std::env::temp_dir().join("ily_rest_test"))
    }

    fn app_with(config: Config, generator: Arc<dyn InferenceClient>, db: Arc<MemoryDatabase>) -> Router {
        let state = Arc::new(AppState {
            config,
            identity: Arc::new(FakeIdentity),
            generator,
            assistant: Arc::new(FakeInference::default()),
            db: db as Arc<dyn Database>,
            payments: None,
            hosting: Arc::new(NoHosting),
            rate_limiter: IpRateLimiter::default(),
            metering: MeterLocks::default(),
            feedback: FeedbackStore::temporary().expect("temporary sled"),
        });
        create_router(state)
    }

    fn harness() -> Harness {
        let db = Arc::new(MemoryDatabase::new());
        let generator = Arc::new(FakeInference::default());
        let app = app_with(test_config(), generator.clone(), db.clone());
        Harness { app, db, generator }
    }

    fn ask(body: serde_json::Value, cookie: Option<&str>, ip: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/ask-ai")
            .header("content-type", "application/json")
            .header("x-forwarded-for", ip);
        if let Some(token) = cookie {
            builder = builder.header("cookie", format!("hf_token={token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_str(&body_string(response).await).unwrap()
    }

    #[tokio::test]
    async fn ask_ai_requires_prompt() {
        let h = harness();
        let response = h.app.oneshot(ask(json!({ "html": "<p>" }), None, "1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], MISSING_FIELDS);
    }

    #[tokio::test]
    async fn anonymous_generation_streams_until_closing_tag() {
        let h = harness();
        let response = h
            .app
            .oneshot(ask(json!({ "prompt": "a bakery", "provider": "auto" }), None, "1.1.1.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

        let text = body_string(response).await;
        assert!(text.ends_with("</html>"), "{text}");
        assert!(!text.contains("trailing"));

        let request = h.generator.last.lock().unwrap().take().unwrap();
        assert_eq!(request.api_key, "hf_default");
        assert_eq!(request.model, "deepseek-ai/DeepSeek-V3-0324:sambanova");
        assert_eq!(request.max_tokens, None);
    }

    #[tokio::test]
    async fn anonymous_callers_are_rate_limited_per_ip() {
        let h = harness();
        for _ in 0..4 {
            let response = h
                .app
                .clone()
                .oneshot(ask(json!({ "prompt": "hi" }), None, "9.9.9.9, 10.0.0.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = h.app.clone().oneshot(ask(json!({ "prompt": "hi" }), None, "9.9.9.9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(response).await["openLogin"], true);

        // Another address still has its own budget.
        let response = h.app.oneshot(ask(json!({ "prompt": "hi" }), None, "8.8.8.8")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn signed_in_generation_is_metered_against_tier() {
        let h = harness();
        let response = h
            .app
            .clone()
            .oneshot(ask(json!({ "prompt": "hi" }), Some("good-token"), "1.1.1.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.generator.last.lock().unwrap().as_ref().unwrap().api_key, "good-token");
        assert_eq!(h.db.count_usage("user-1", None).await.unwrap(), 1);

        // Free tier allows a single request.
        let response = h
            .app
            .oneshot(ask(json!({ "prompt": "again" }), Some("good-token"), "1.1.1.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body_json(response).await["openPaywall"], true);
    }

    /// Opens slowly so that concurrent requests overlap.
    struct SlowInference;

    #[async_trait]
    impl InferenceClient for SlowInference {
        async fn stream_chat(&self, _: ChatRequest) -> AppResult<TextStream> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let doc = "<!DOCTYPE html><html></html>".to_string();
            Ok(futures::stream::iter([Ok(doc)]).boxed())
        }
    }

    #[tokio::test]
    async fn concurrent_signed_in_generations_share_one_quota() {
        let db = Arc::new(MemoryDatabase::new());
        let app = app_with(test_config(), Arc::new(SlowInference), db.clone());

        let (first, second) = tokio::join!(
            app.clone().oneshot(ask(json!({ "prompt": "one" }), Some("good-token"), "1.1.1.1")),
            app.clone().oneshot(ask(json!({ "prompt": "two" }), Some("good-token"), "1.1.1.1")),
        );
        let mut statuses = [first.unwrap().status(), second.unwrap().status()];
        statuses.sort();
        assert_eq!(statuses, [StatusCode::OK, StatusCode::PAYMENT_REQUIRED]);
        assert_eq!(db.count_usage("user-1", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unreachable_upstream_fails_without_metering() {
        let db = Arc::new(MemoryDatabase::new());
        let generator = ChatCompletionsClient::new(reqwest::Client::new(), "http://127.0.0.1:1/chat");
        let app = app_with(test_config(), Arc::new(generator), db.clone());

        let response = app
            .clone()
            .oneshot(ask(json!({ "prompt": "hi" }), Some("good-token"), "1.1.1.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(db.count_usage("user-1", None).await.unwrap(), 0);

        // The free request is still available once the upstream is back.
        let usage = billing::usage_summary(db.as_ref(), "user-1").await.unwrap();
        assert!(usage.used < usage.limit);
    }

    #[tokio::test]
    async fn anonymous_generation_needs_a_default_token() {
        let mut config = test_config();
        config.default_hf_token = None;
        let app = app_with(config, Arc::new(FakeInference::default()), Arc::new(MemoryDatabase::new()));

        let response = app.oneshot(ask(json!({ "prompt": "hi" }), None, "1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "Default HF token not configured");
    }

    #[tokio::test]
    async fn assistant_needs_a_server_key() {
        let mut config = test_config();
        config.deepseek_api_key = None;
        let app = app_with(config, Arc::new(FakeInference::default()), Arc::new(MemoryDatabase::new()));

        let request = Request::builder()
            .method("POST")
            .uri("/api/ai-assistant")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "prompt": "why", "html": "<p>" }).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "DeepSeek API key not configured");
    }

    #[tokio::test]
    async fn recent_feedback_requires_a_known_user() {
        let h = harness();
        let recent = |cookie: &str| {
            Request::builder()
                .uri("/api/ai-feedback/recent?limit=5")
                .header("cookie", format!("hf_token={cookie}"))
                .body(Body::empty())
                .unwrap()
        };

        let response = h.app.clone().oneshot(recent("garbage")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = h.app.oneshot(recent("good-token")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!([]));
    }

    #[tokio::test]
    async fn invalid_session_on_generation_is_unauthorized() {
        let h = harness();
        let response = h
            .app
            .oneshot(ask(json!({ "prompt": "hi" }), Some("stale"), "1.1.1.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn pinned_provider_rejects_oversized_context() {
        let h = harness();
        let prompt = "x".repeat(9_000);
        let response = h
            .app
            .oneshot(ask(json!({ "prompt": prompt, "provider": "sambanova" }), None, "1.1.1.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["openSelectProvider"], true);
        assert_eq!(body["message"], "Context is too long. SambaNova allow 8000 max tokens.");
    }

    #[tokio::test]
    async fn me_requires_a_valid_session() {
        let h = harness();
        let response = h
            .app
            .clone()
            .oneshot(Request::get("/api/auth/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/api/auth/me")
                    .header("cookie", "hf_token=stale")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let cleared = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cleared.starts_with("hf_token="), "{cleared}");

        let response = h
            .app
            .oneshot(
                Request::get("/api/auth/me")
                    .header("cookie", "hf_token=good-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["preferred_username"], "alice");
    }

    #[tokio::test]
    async fn login_redirects_to_identity_provider() {
        let h = harness();
        let response = h
            .app
            .oneshot(Request::get("/api/auth/login").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://id.example/oauth/authorize?client_id=client-id"));
        assert!(location.contains("response_type=code"));
        assert!(location.contains("state="));
    }

    #[tokio::test]
    async fn callback_validates_state_and_sets_session() {
        let h = harness();
        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/api/auth/callback?code=valid-code&state=forged")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[header::LOCATION], "/?error=invalid_state");

        let state = auth::create_state("test-state-secret").unwrap();
        let response = h
            .app
            .oneshot(
                Request::get(format!("/api/auth/callback?code=valid-code&state={state}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[header::LOCATION], "/");
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("hf_token=good-token"));
        assert!(cookie.contains("HttpOnly"));

        let user = h.db.find_user("user-1").await.unwrap().unwrap();
        assert_eq!(user.email.as_deref(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn session_routes_reject_anonymous_callers() {
        let h = harness();
        let response = h
            .app
            .oneshot(
                Request::post("/api/deploy")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "html": "<p>", "title": "x" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "Authentication required");
    }

    #[tokio::test]
    async fn remix_reports_missing_space() {
        let h = harness();
        let response = h
            .app
            .clone()
            .oneshot(Request::get("/api/remix/alice").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = h
            .app
            .oneshot(Request::get("/api/remix/alice/site").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "Space not found");
    }

    #[tokio::test]
    async fn robots_points_at_sitemap() {
        let h = harness();
        let response = h
            .app
            .oneshot(Request::get("/robots.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_string(response).await;
        assert!(text.contains("Disallow: /api/"));
        assert!(text.contains("Sitemap: http://localhost:3000/sitemap.xml"));
    }
}
