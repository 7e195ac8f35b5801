// src/utils.rs
use actix_web::{HttpRequest, HttpResponse, ResponseError};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::RateLimiter;
use log::{debug, error};
use std::fmt;
use std::net::IpAddr;

use crate::storage::StoreError;

pub type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Limits read and watcher requests.
pub struct ApiLimiter(pub KeyedLimiter);

/// Limits server registration, which costs a live query per request.
pub struct RegisterLimiter(pub KeyedLimiter);

#[derive(Debug)]
pub enum RequestError {
    MissingPeerIP,
    RateLimitExceeded,
    InvalidAddress(String),
    InvalidTarget(String),
    NotFound(String),
    VerificationFailed(String),
    Store(StoreError),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPeerIP => write!(f, "Failed to extract client IP"),
            Self::RateLimitExceeded => write!(f, "Rate limit exceeded"),
            Self::InvalidAddress(addr) => write!(f, "Invalid server address: {}", addr),
            Self::InvalidTarget(target) => write!(f, "Invalid watcher target: {}", target),
            Self::NotFound(what) => write!(f, "{} not found", what),
            Self::VerificationFailed(reason) => write!(f, "Server did not answer a status query: {}", reason),
            Self::Store(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl From<StoreError> for RequestError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownServer(id) => Self::NotFound(format!("Server {}", id)),
            e => Self::Store(e),
        }
    }
}

impl ResponseError for RequestError {
    fn error_response(&self) -> HttpResponse {
        match self {
            Self::RateLimitExceeded => HttpResponse::TooManyRequests().body(self.to_string()),
            Self::NotFound(_) => HttpResponse::NotFound().body(self.to_string()),
            Self::VerificationFailed(_) => HttpResponse::UnprocessableEntity().body(self.to_string()),
            Self::Store(e) => {
                error!("Request failed on storage: {}", e);
                HttpResponse::ServiceUnavailable().body(self.to_string())
            }
            _ => HttpResponse::BadRequest().body(self.to_string()),
        }
    }
}

/// Client IP for rate limiting.
///
/// Forwarding headers are only honoured from a loopback peer, i.e. a local
/// reverse proxy.
pub fn extract_client_ip(req: &HttpRequest) -> Result<IpAddr, RequestError> {
    let peer_ip = req.peer_addr().map(|addr| addr.ip()).ok_or(RequestError::MissingPeerIP)?;
    if !peer_ip.is_loopback() {
        return Ok(peer_ip);
    }

    let forwarded = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| req.headers().get("X-Real-IP").and_then(|v| v.to_str().ok()))
        .and_then(|v| v.trim().parse::<IpAddr>().ok());

    match forwarded {
        Some(ip) => {
            debug!("Using forwarded client IP {} from proxy {}", ip, peer_ip);
            Ok(ip)
        }
        None => Ok(peer_ip),
    }
}

pub fn check_rate(limiter: &KeyedLimiter, req: &HttpRequest, what: &str) -> Result<IpAddr, RequestError> {
    let ip = extract_client_ip(req)?;
    if limiter.check_key(&ip).is_err() {
        error!("Rate limit exceeded for {} for ip: {}", what, ip);
        return Err(RequestError::RateLimitExceeded);
    }
    Ok(ip)
}

/// Canonical `host:port` form of a query address.
pub fn normalize_address(raw: &str) -> Result<String, RequestError> {
    let raw = raw.trim();
    let invalid = || RequestError::InvalidAddress(raw.to_string());

    let (host, port) = raw.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if port == 0 || host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }

    Ok(match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, port),
        Ok(ip) => format!("{}:{}", ip, port),
        Err(_) => format!("{}:{}", host.to_ascii_lowercase(), port),
    })
}

pub fn validate_target(raw: &str) -> Result<String, RequestError> {
    let target = raw.trim();
    if target.len() > 512 || !(target.starts_with("https://") || target.starts_with("http://")) {
        return Err(RequestError::InvalidTarget(target.to_string()));
    }
    Ok(target.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address(" 10.0.0.1:27015 ").unwrap(), "10.0.0.1:27015");
        assert_eq!(normalize_address("Ark.Example.COM:27015").unwrap(), "ark.example.com:27015");
        assert_eq!(normalize_address("[::1]:27015").unwrap(), "[::1]:27015");
        assert!(normalize_address("10.0.0.1").is_err());
        assert!(normalize_address("10.0.0.1:0").is_err());
        assert!(normalize_address(":27015").is_err());
        assert!(normalize_address("10.0.0.1:99999").is_err());
    }

    #[test]
    fn test_validate_target() {
        assert!(validate_target("https://hooks.example/a").is_ok());
        assert!(validate_target("ftp://hooks.example/a").is_err());
        assert!(validate_target("").is_err());
    }

    #[test]
    fn test_forwarded_ip_only_from_loopback() {
        let proxied = TestRequest::default()
            .peer_addr("127.0.0.1:5000".parse().unwrap())
            .insert_header(("X-Forwarded-For", "203.0.113.7, 10.0.0.1"))
            .to_http_request();
        assert_eq!(extract_client_ip(&proxied).unwrap(), "203.0.113.7".parse::<IpAddr>().unwrap());

        let direct = TestRequest::default()
            .peer_addr("198.51.100.2:5000".parse().unwrap())
            .insert_header(("X-Forwarded-For", "203.0.113.7"))
            .to_http_request();
        assert_eq!(extract_client_ip(&direct).unwrap(), "198.51.100.2".parse::<IpAddr>().unwrap());

        assert!(matches!(
            extract_client_ip(&TestRequest::default().to_http_request()),
            Err(RequestError::MissingPeerIP)
        ));
    }

    #[test]
    fn test_unknown_server_maps_to_not_found() {
        let err: RequestError = StoreError::UnknownServer(4).into();
        assert_eq!(err.error_response().status(), actix_web::http::StatusCode::NOT_FOUND);
    }
}
