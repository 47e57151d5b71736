//! HTTP Server implementation

use crate::AppState;
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::Local;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tally_common::TallyConfig;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

type HttpResponse = Response<BoxBody<Bytes, Infallible>>;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

/// Bind the HTTP listener
///
/// Failure here is fatal for the process: there is nothing to count without it.
pub async fn bind(config: &TallyConfig) -> Result<TcpListener> {
    let addr = config
        .listen_address()
        .context("Invalid listen address")?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on http://{}", addr);
    Ok(listener)
}

/// Run the HTTP server
pub async fn run_server(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(state, req, remote_addr).await }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Connection error: {:?}", err);
            }
        });
    }
}

/// Handle incoming HTTP request
async fn handle_request(
    state: Arc<AppState>,
    req: Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<HttpResponse, Infallible> {
    let method = req.method();
    let path = req.uri().path();

    let response = route(&state, method, path);

    if state.config.access_log {
        info!(
            "{} {} {} - {}",
            remote_addr.ip(),
            method,
            path,
            response.status().as_u16()
        );
    }

    Ok(response)
}

/// Dispatch a request to the counter routes
pub fn route(state: &AppState, method: &Method, path: &str) -> HttpResponse {
    let known = matches!(
        path,
        "/add" | "/api/counter" | "/api/counter/daily" | "/api/counter/total"
    );
    if !known {
        return error_response(StatusCode::NOT_FOUND, "Not Found");
    }
    if *method != Method::GET {
        let mut response = error_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET"));
        return response;
    }

    match path {
        "/add" => {
            state.store.increment(&Local::now());
            text_response("Request received!")
        }
        "/api/counter" => match state.store.snapshot().to_json() {
            Ok(json) => body_response(StatusCode::OK, APPLICATION_JSON, json),
            Err(e) => {
                error!("Failed to encode stats: {}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        },
        "/api/counter/daily" => {
            // Today is read from the clock here, independently of /add
            let today = crate::store::date_key(&Local::now());
            text_response(state.store.daily(&today).to_string())
        }
        _ => text_response(state.store.total().to_string()),
    }
}

/// Create a full body response
fn full_body(data: impl Into<Bytes>) -> BoxBody<Bytes, Infallible> {
    Full::new(data.into()).boxed()
}

fn body_response(
    status: StatusCode,
    content_type: &'static str,
    data: impl Into<Bytes>,
) -> HttpResponse {
    let mut response = Response::new(full_body(data));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn text_response(body: impl Into<Bytes>) -> HttpResponse {
    body_response(StatusCode::OK, TEXT_PLAIN, body)
}

/// Create an error response
fn error_response(status: StatusCode, message: &str) -> HttpResponse {
    let body = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>{} {}</title></head>
<body>
    <h1>{} {}</h1>
    <hr>
    <p>Tally Server</p>
</body>
</html>"#,
        status.as_u16(),
        message,
        status.as_u16(),
        message
    );

    body_response(status, "text/html", body)
}
