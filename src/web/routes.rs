use super::{ApiError, AppContext};
use crate::api::events::Notice;
use crate::api::models::{ChipPair, Connection, Message, Prompt, Stats};
use crate::connections::{ConnectionUpdate, NewConnection};
use crate::pairs::NewPair;
use crate::prompts::NewPrompt;
use crate::scheduler::StartOutcome;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct PromptText {
    #[serde(default)]
    prompt: String,
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/connections", get(list_connections).post(create_connection))
        .route(
            "/api/connections/{id}",
            get(get_connection).patch(update_connection).delete(delete_connection),
        )
        .route("/api/connections/{id}/sync", post(sync_connection))
        .route("/api/pairs", get(list_pairs).post(add_pair))
        .route("/api/pairs/{id}", get(get_pair).delete(remove_pair))
        .route("/api/pairs/{id}/toggle", post(toggle_pair))
        .route("/api/pairs/{id}/prompt-override", post(toggle_prompt_override))
        .route("/api/pairs/{id}/prompt", put(set_pair_prompt))
        .route("/api/pairs/{id}/messages", get(pair_messages))
        .route("/api/prompts", get(list_prompts).post(create_prompt))
        .route("/api/prompts/{id}", delete(delete_prompt))
        .route("/api/prompts/{id}/global", post(set_global_prompt))
        .route("/api/maturador/start", post(start))
        .route("/api/maturador/stop", post(stop))
        .route("/api/maturador/stats", get(stats))
        .route("/api/maturador/pairs/{id}/turn", post(run_turn))
        .route("/api/notices", get(notices))
        .with_state(ctx)
}

async fn health(State(ctx): State<AppContext>) -> ApiResult<Value> {
    Ok(Json(json!({
        "status": "ok",
        "running": ctx.scheduler.is_running(),
        "activeConnections": ctx.connections.active_count()?,
        "timers": ctx.scheduler.timer_count(),
    })))
}

// Connections

async fn list_connections(State(ctx): State<AppContext>) -> ApiResult<Vec<Connection>> {
    Ok(Json(ctx.connections.list()?))
}

async fn get_connection(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult<Connection> {
    Ok(Json(ctx.connections.get(&id)?))
}

async fn create_connection(
    State(ctx): State<AppContext>,
    Json(body): Json<NewConnection>,
) -> Result<(StatusCode, Json<Connection>), ApiError> {
    let connection = ctx.connections.create(body).await?;
    Ok((StatusCode::CREATED, Json(connection)))
}

async fn update_connection(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(body): Json<ConnectionUpdate>,
) -> ApiResult<Connection> {
    Ok(Json(ctx.connections.update(&id, body)?))
}

async fn delete_connection(State(ctx): State<AppContext>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    ctx.connections.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sync_connection(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult<Connection> {
    Ok(Json(ctx.connections.synchronize(&id).await?))
}

// Pairs

async fn list_pairs(State(ctx): State<AppContext>) -> ApiResult<Vec<ChipPair>> {
    Ok(Json(ctx.pairs.list()?))
}

async fn get_pair(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult<ChipPair> {
    Ok(Json(ctx.pairs.get(&id)?))
}

async fn add_pair(
    State(ctx): State<AppContext>,
    Json(body): Json<NewPair>,
) -> Result<(StatusCode, Json<ChipPair>), ApiError> {
    let pair = ctx.pairs.add(body)?;
    Ok((StatusCode::CREATED, Json(pair)))
}

async fn remove_pair(State(ctx): State<AppContext>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    ctx.pairs.remove(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_pair(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult<ChipPair> {
    Ok(Json(ctx.pairs.toggle_active(&id)?))
}

async fn toggle_prompt_override(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult<ChipPair> {
    Ok(Json(ctx.pairs.toggle_prompt_override(&id)?))
}

async fn set_pair_prompt(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(body): Json<PromptText>,
) -> ApiResult<ChipPair> {
    Ok(Json(ctx.pairs.set_prompt(&id, &body.prompt)?))
}

async fn pair_messages(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult<Vec<Message>> {
    ctx.pairs.get(&id)?;
    Ok(Json(ctx.scheduler.pair_messages(&id)?))
}

// Prompts

async fn list_prompts(State(ctx): State<AppContext>) -> ApiResult<Vec<Prompt>> {
    Ok(Json(ctx.prompts.list()?))
}

async fn create_prompt(
    State(ctx): State<AppContext>,
    Json(body): Json<NewPrompt>,
) -> Result<(StatusCode, Json<Prompt>), ApiError> {
    let prompt = ctx.prompts.create(body)?;
    Ok((StatusCode::CREATED, Json(prompt)))
}

async fn delete_prompt(State(ctx): State<AppContext>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    ctx.prompts.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_global_prompt(State(ctx): State<AppContext>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    ctx.prompts.set_global(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// Scheduler

async fn start(State(ctx): State<AppContext>) -> ApiResult<StartOutcome> {
    Ok(Json(ctx.scheduler.start()?))
}

async fn stop(State(ctx): State<AppContext>) -> ApiResult<Value> {
    let cancelled = ctx.scheduler.stop()?;
    Ok(Json(json!({ "cancelledTimers": cancelled })))
}

async fn stats(State(ctx): State<AppContext>) -> ApiResult<Stats> {
    Ok(Json(ctx.scheduler.stats()?))
}

async fn run_turn(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult<Message> {
    Ok(Json(ctx.scheduler.run_turn(&id).await?))
}

async fn notices(State(ctx): State<AppContext>) -> Json<Vec<Notice>> {
    Json(ctx.notifier.recent())
}
