// src/handlers/servers.rs
use actix_web::{web, HttpRequest, HttpResponse};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;

use crate::handlers::ApiState;
use crate::models::server::ServerId;
use crate::query::QueryError;
use crate::utils::{check_rate, normalize_address, ApiLimiter, RegisterLimiter, RequestError};

pub async fn list_servers(
    state: web::Data<ApiState>,
    limiter: web::Data<ApiLimiter>,
    req: HttpRequest,
) -> Result<HttpResponse, RequestError> {
    check_rate(&limiter.0, &req, "server list")?;

    let servers = state.store.list_all_servers().await?;
    debug!("Returning {} servers", servers.len());
    Ok(HttpResponse::Ok().json(servers))
}

pub async fn get_server(
    state: web::Data<ApiState>,
    limiter: web::Data<ApiLimiter>,
    path: web::Path<ServerId>,
    req: HttpRequest,
) -> Result<HttpResponse, RequestError> {
    check_rate(&limiter.0, &req, "server lookup")?;

    let id = path.into_inner();
    match state.store.get_server(id).await? {
        Some(record) => Ok(HttpResponse::Ok().json(record)),
        None => Err(RequestError::NotFound(format!("Server {}", id))),
    }
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    address: String,
}

/// Register a server after it answers one state query.
pub async fn register_server(
    state: web::Data<ApiState>,
    limiter: web::Data<RegisterLimiter>,
    body: web::Json<RegisterRequest>,
    req: HttpRequest,
) -> Result<HttpResponse, RequestError> {
    let client_ip = check_rate(&limiter.0, &req, "server registration")?;
    let address = normalize_address(&body.address)?;

    let verified = tokio::time::timeout(state.query_timeout, state.query.query_state(&address, state.query_timeout))
        .await
        .unwrap_or(Err(QueryError::Timeout(state.query_timeout)));
    let snapshot = match verified {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Refusing to register {} for {}: {}", address, client_ip, e);
            return Err(RequestError::VerificationFailed(e.to_string()));
        }
    };

    let id = state.store.register_server(&address).await?;
    info!("Registered server {} ({}) as {}", address, snapshot.display_name(), id);
    Ok(HttpResponse::Created().json(json!({ "id": id, "address": address })))
}

pub async fn delete_server(
    state: web::Data<ApiState>,
    limiter: web::Data<ApiLimiter>,
    path: web::Path<ServerId>,
    req: HttpRequest,
) -> Result<HttpResponse, RequestError> {
    check_rate(&limiter.0, &req, "server delete")?;

    let id = path.into_inner();
    if state.store.delete_server(id).await? {
        info!("Removed server {}", id);
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(RequestError::NotFound(format!("Server {}", id)))
    }
}
