// src/handlers/watchers.rs
use actix_web::{web, HttpRequest, HttpResponse};
use log::info;
use serde::Deserialize;
use serde_json::json;

use crate::handlers::ApiState;
use crate::models::server::ServerId;
use crate::utils::{check_rate, validate_target, ApiLimiter, RequestError};

#[derive(Deserialize)]
pub struct WatcherTarget {
    target: String,
}

pub async fn add_watcher(
    state: web::Data<ApiState>,
    limiter: web::Data<ApiLimiter>,
    path: web::Path<ServerId>,
    body: web::Json<WatcherTarget>,
    req: HttpRequest,
) -> Result<HttpResponse, RequestError> {
    check_rate(&limiter.0, &req, "watch")?;

    let server_id = path.into_inner();
    let target = validate_target(&body.target)?;
    let id = state.watchers.add_watcher(server_id, &target).await?;
    info!("Watcher {} now follows server {}", id, server_id);
    Ok(HttpResponse::Created().json(json!({ "id": id, "server_id": server_id })))
}

pub async fn remove_watcher(
    state: web::Data<ApiState>,
    limiter: web::Data<ApiLimiter>,
    path: web::Path<ServerId>,
    query: web::Query<WatcherTarget>,
    req: HttpRequest,
) -> Result<HttpResponse, RequestError> {
    check_rate(&limiter.0, &req, "unwatch")?;

    let server_id = path.into_inner();
    if state.watchers.remove_watcher(server_id, query.target.trim()).await? {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(RequestError::NotFound(format!("Watcher on server {}", server_id)))
    }
}
