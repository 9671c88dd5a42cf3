use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE, WWW_AUTHENTICATE},
        HeaderMap, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use serde_json::json;
use tower_http::services::ServeDir;

use crate::{
    catalog::{self, ModelPatch},
    config::Config,
    crypto::SecretCipher,
    db::{AdminStore, SqliteStore},
    dispatch,
    error::{CatalogError, DispatchError, ProviderError, SyncError},
    llm::{self, ChatRequest},
    models::{Catalog, ModelKey},
    providers::{self, NewProvider, ProviderPatch},
    sync, telemetry,
};

/**
 * \brief 请求处理共享的依赖；每个请求都会重新读取存储。
 */
#[derive(Clone)]
pub struct AppState {
    pub store: AdminStore,
    pub cipher: SecretCipher,
    pub config: Arc<Config>,
    /** \brief 带整体超时，用于模型列表等一次性请求 */
    pub client: reqwest::Client,
    /** \brief 仅限制连接超时，用于长时间的流式转发 */
    pub stream_client: reqwest::Client,
    pub mock_delay: Duration,
}

impl AppState {
    pub fn new(store: AdminStore, cipher: SecretCipher, config: Config) -> Result<Self> {
        Ok(AppState {
            client: config.http_client()?,
            stream_client: config.streaming_client()?,
            store,
            cipher,
            config: Arc::new(config),
            mock_delay: Duration::from_millis(200),
        })
    }

    /**
     * \brief 按配置打开 SQLite 存储并构建状态。
     */
    pub fn from_config(config: Config) -> Result<Self> {
        let kv = SqliteStore::open(&config.db_path)?;
        let store = AdminStore::new(Arc::new(kv), config.environment.clone());
        let cipher = SecretCipher::from_base64_key(config.encryption_key.as_deref())?;
        Self::new(store, cipher, config)
    }
}

/**
 * \brief 组装全部路由。
 */
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route(
            "/providers",
            get(list_providers)
                .post(create_provider)
                .put(update_provider)
                .delete(delete_provider),
        )
        .route(
            "/models",
            get(admin_models).put(replace_models).patch(patch_model),
        )
        .route("/models/sync", post(sync_models))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_gate));

    let static_service =
        ServeDir::new(&state.config.ui_dir).append_index_html_on_directories(true);

    Router::new()
        .nest("/api/admin", admin)
        .route("/api/models", get(public_models))
        .route("/api/chat", post(chat))
        .route("/api/mock-chat", post(mock_chat))
        .route("/api/health", get(health_check))
        .fallback_service(static_service)
        .with_state(state)
}

/**
 * \brief 启动 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, config: Config) -> Result<()> {
    if config.encryption_key.is_none() {
        telemetry::log_event(
            "server",
            "ENCRYPTION_KEY not set, new api keys will be stored as PLAINTEXT",
        );
    }
    let state = AppState::from_config(config)?;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    telemetry::log_event("server", &format!("listening on http://{}", addr));
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 管理接口的 Basic Auth 校验。
 * \details 未配置凭据时：开发环境放行，生产环境一律拒绝。
 */
pub fn admin_authorized(config: &Config, headers: &HeaderMap) -> bool {
    let (Some(user), Some(pass)) = (config.admin_user.as_deref(), config.admin_pass.as_deref())
    else {
        return !config.production;
    };
    let Some(raw) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = raw
        .strip_prefix("Basic ")
        .or_else(|| raw.strip_prefix("basic "))
    else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let decoded = String::from_utf8_lossy(&decoded);
    matches!(decoded.split_once(':'), Some((u, p)) if u == user && p == pass)
}

async fn admin_gate(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if admin_authorized(&state.config, req.headers()) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(WWW_AUTHENTICATE, "Basic realm=\"Admin\"")],
            "Unauthorized",
        )
            .into_response()
    }
}

fn admin_fail(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "ok": false, "error": message.to_string() })),
    )
        .into_response()
}

fn internal_err<E: std::fmt::Display>(e: E) -> Response {
    telemetry::log_error("server", &e.to_string());
    admin_fail(StatusCode::INTERNAL_SERVER_ERROR, e)
}

fn provider_err(e: ProviderError) -> Response {
    match e {
        ProviderError::Store(_) => internal_err(e),
        other => admin_fail(StatusCode::BAD_REQUEST, other),
    }
}

fn catalog_err(e: CatalogError) -> Response {
    match e {
        CatalogError::Store(_) => internal_err(e),
        other => admin_fail(StatusCode::BAD_REQUEST, other),
    }
}

fn dispatch_err(e: DispatchError) -> Response {
    let status = match e {
        DispatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    telemetry::log_error("chat", &format!("dispatch failed code={} {}", e.code(), e));
    (
        status,
        Json(json!({ "error": { "code": e.code(), "message": e.to_string() } })),
    )
        .into_response()
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "env": state.store.environment() }))
}

async fn list_providers(State(state): State<AppState>) -> Response {
    match providers::list(&state.store) {
        Ok(list) => Json(json!({ "providers": list })).into_response(),
        Err(e) => internal_err(e),
    }
}

async fn create_provider(
    State(state): State<AppState>,
    Json(input): Json<NewProvider>,
) -> Response {
    match providers::create(&state.store, &state.cipher, input) {
        Ok(_) => Json(json!({ "ok": true })).into_response(),
        Err(e) => provider_err(e),
    }
}

async fn update_provider(
    State(state): State<AppState>,
    Json(patch): Json<ProviderPatch>,
) -> Response {
    match providers::update(&state.store, &state.cipher, patch) {
        Ok(_) => Json(json!({ "ok": true })).into_response(),
        Err(e) => provider_err(e),
    }
}

#[derive(Deserialize, Debug)]
struct IdQuery {
    id: Option<String>,
}

async fn delete_provider(State(state): State<AppState>, Query(q): Query<IdQuery>) -> Response {
    let Some(id) = q.id.filter(|id| !id.is_empty()) else {
        return admin_fail(StatusCode::BAD_REQUEST, "missing id");
    };
    match providers::delete(&state.store, &id) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => provider_err(e),
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AdminModelsQuery {
    include_disabled: Option<bool>,
}

async fn admin_models(
    State(state): State<AppState>,
    Query(q): Query<AdminModelsQuery>,
) -> Response {
    let Catalog { models, defaults } = match state.store.load_catalog() {
        Ok(c) => c,
        Err(e) => return internal_err(e),
    };
    let models = if q.include_disabled.unwrap_or(true) {
        models
    } else {
        catalog::enabled_only(models)
    };
    Json(json!({ "models": models, "defaults": defaults })).into_response()
}

async fn replace_models(State(state): State<AppState>, Json(body): Json<Catalog>) -> Response {
    let count = body.models.len();
    match catalog::replace_catalog(&state.store, body) {
        Ok(()) => {
            telemetry::log_event("admin.models", &format!("replace total={}", count));
            Json(json!({ "ok": true, "total": count })).into_response()
        }
        Err(e) => catalog_err(e),
    }
}

#[derive(Deserialize, Debug)]
struct PatchModelBody {
    id: String,
    #[serde(flatten)]
    patch: ModelPatch,
}

async fn patch_model(State(state): State<AppState>, Json(body): Json<PatchModelBody>) -> Response {
    let (provider, value) = match dispatch::split_model_id(&body.id) {
        Ok(parts) => parts,
        Err(e) => return admin_fail(StatusCode::BAD_REQUEST, e),
    };
    let key = ModelKey::new(provider, value);
    match catalog::update_model(&state.store, &key, body.patch) {
        Ok(model) => Json(json!({ "ok": true, "model": model })).into_response(),
        Err(e) => catalog_err(e),
    }
}

#[derive(Deserialize, Debug)]
struct SyncQuery {
    provider: Option<String>,
}

async fn sync_models(State(state): State<AppState>, Query(q): Query<SyncQuery>) -> Response {
    let target = q.provider.as_deref().filter(|s| !s.is_empty());
    match sync::sync(&state.store, &state.cipher, &state.client, target).await {
        Ok(report) => Json(json!({
            "ok": true,
            "total": report.total_models,
            "synced": report.synced,
            "skipped": report.skipped,
        }))
        .into_response(),
        Err(SyncError::NoProviders) => admin_fail(StatusCode::BAD_REQUEST, SyncError::NoProviders),
        Err(e) => internal_err(e),
    }
}

async fn public_models(State(state): State<AppState>) -> Response {
    match catalog::public_catalog(&state.store) {
        Ok(public) => Json(public).into_response(),
        Err(e) => internal_err(e),
    }
}

#[derive(Deserialize, Debug)]
struct ChatBody {
    #[serde(default)]
    model: Option<String>,
    #[serde(flatten)]
    request: ChatRequest,
}

fn event_stream(body: Body) -> Response {
    (
        [
            (CONTENT_TYPE, "text/event-stream; charset=utf-8"),
            (CACHE_CONTROL, "no-cache, no-transform"),
        ],
        body,
    )
        .into_response()
}

fn mock_response(delay: Duration) -> Response {
    event_stream(Body::from_stream(llm::mock_sse_stream(delay)))
}

/**
 * \brief 对话接口：解析组合模型 ID 并原样转发上游 SSE；未指定模型或上游不可用时回退演示流。
 */
async fn chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> Response {
    let Some(model) = body.model.filter(|m| !m.trim().is_empty()) else {
        return mock_response(state.mock_delay);
    };
    let target = match dispatch::resolve(&state.store, &state.cipher, &model) {
        Ok(target) => target,
        Err(e) => return dispatch_err(e),
    };
    telemetry::log_event(
        "chat",
        &format!(
            "dispatch provider={} model={} msgs={}",
            target.provider_slug,
            target.upstream_model_id,
            body.request.messages.len()
        ),
    );
    match llm::open_chat_stream(&state.stream_client, &target, &body.request).await {
        Ok(resp) => event_stream(Body::from_stream(resp.bytes_stream())),
        Err(e) => {
            telemetry::log_error("chat", &format!("upstream failed, using demo stream: {}", e));
            mock_response(state.mock_delay)
        }
    }
}

async fn mock_chat(State(state): State<AppState>) -> Response {
    mock_response(state.mock_delay)
}
