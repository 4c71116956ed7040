//! Ingestion API used by field devices and the admin CLI.
//!
//! Every mutating route takes a permit from the [`AdmissionGate`] before it
//! reads the request body. A held permit turns the request away with
//! `500 {"Status":"Busy"}` instead of queuing it.

use crate::gate::{AdmissionGate, GateError, Permit, PermitGuard};
use crate::metrics;
use crate::registry::DeviceRegistry;
use crate::storage::{with_timeout, StoreError, TimeseriesSink};
use chrono::Utc;
use hyper::service::{make_service_fn, service_fn};
use hyper::header::{self, HeaderValue};
use hyper::{body::to_bytes, Body, Method, Request, Response, Server, StatusCode};
use iotedge_shared::protocol::http::{
    Output, SensorValues, URI_DEVICE_CONFIGURE, URI_INIT_DEVICE, URI_LOGGING, URI_SAVE_TIMESERIES,
    URI_SENSOR_CONFIGURE, URI_UPDATE_SENSOR, URI_UPLOAD_DATA,
};
use iotedge_shared::{ConfigureDeviceRequest, ConfigureSensorRequest, InitDeviceRequest, LogMessage, Series};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Deadline for sink writes made on behalf of a request
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

const KNOWN_PATHS: [&str; 7] = [
    URI_SAVE_TIMESERIES,
    URI_UPLOAD_DATA,
    URI_INIT_DEVICE,
    URI_DEVICE_CONFIGURE,
    URI_SENSOR_CONFIGURE,
    URI_UPDATE_SENSOR,
    URI_LOGGING,
];

/// Shared handles for the request handlers.
pub struct ApiState {
    pub gate: AdmissionGate,
    pub registry: DeviceRegistry,
    pub sink: Arc<dyn TimeseriesSink>,
}

/// Bind the API listener. The returned future serves until `cancel` fires.
pub fn bind_api(
    addr: SocketAddr,
    state: Arc<ApiState>,
    cancel: CancellationToken,
) -> Result<(SocketAddr, impl Future<Output = Result<(), hyper::Error>>), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                let state = state.clone();
                async move { handle_api(req, &state).await }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local = server.local_addr();
    tracing::info!("Ingestion API listening on {}", local);
    let server = server.with_graceful_shutdown(async move { cancel.cancelled().await });
    Ok((local, server))
}

fn json_response(body: String, status: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = status;
    let headers = res.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    res
}

fn output_response(output: &Output, status: StatusCode) -> Response<Body> {
    json_response(serde_json::to_string(output).unwrap_or_default(), status)
}

fn record_response<T: serde::Serialize>(record: &T) -> Response<Body> {
    match serde_json::to_string(record) {
        Ok(body) => json_response(body, StatusCode::OK),
        Err(e) => output_response(&Output::error(e.to_string()), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = status;
    res
}

fn cors_preflight() -> Response<Body> {
    let mut res = empty_response(StatusCode::NO_CONTENT);
    let headers = res.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST, OPTIONS"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    res
}

/// Failure of a single request, mapped onto the response envelope.
#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error(transparent)]
    Busy(#[from] GateError),

    #[error("input error: {0}")]
    Input(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to read request body: {0}")]
    Body(#[from] hyper::Error),
}

impl ApiError {
    fn into_response(self) -> Response<Body> {
        let output = match &self {
            ApiError::Busy(_) => Output::busy(),
            other => Output::error(other.to_string()),
        };
        output_response(&output, StatusCode::INTERNAL_SERVER_ERROR)
    }
}

pub async fn handle_api(req: Request<Body>, state: &ApiState) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let response = if method == Method::OPTIONS && KNOWN_PATHS.contains(&path.as_str()) {
        cors_preflight()
    } else {
        match route(req, &path, &method, state).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(path = %path, "request failed: {}", e);
                e.into_response()
            }
        }
    };

    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&[metric_path(&path), response.status().as_str()])
        .inc();
    Ok(response)
}

fn metric_path(path: &str) -> &str {
    KNOWN_PATHS
        .iter()
        .find(|known| **known == path)
        .copied()
        .unwrap_or("other")
}

async fn route(
    req: Request<Body>,
    path: &str,
    method: &Method,
    state: &ApiState,
) -> Result<Response<Body>, ApiError> {
    match (method, path) {
        (&Method::POST, URI_SAVE_TIMESERIES) => save_timeseries(req, state).await,
        (&Method::POST, URI_UPLOAD_DATA) => upload_data(req, state).await,
        (&Method::POST, URI_INIT_DEVICE) => {
            let (_guard, body) = admit_and_read::<InitDeviceRequest>(&state.gate.admin, req).await?;
            let device = state.registry.init_device(&body.device).await?;
            Ok(record_response(&device))
        }
        (&Method::POST, URI_DEVICE_CONFIGURE) => {
            let (_guard, body) = admit_and_read::<ConfigureDeviceRequest>(&state.gate.admin, req).await?;
            let device = state.registry.configure_device(&body).await?;
            Ok(record_response(&device))
        }
        (&Method::POST, URI_SENSOR_CONFIGURE) => {
            let (_guard, body) = admit_and_read::<ConfigureSensorRequest>(&state.gate.admin, req).await?;
            let device = state.registry.configure_sensor(&body).await?;
            Ok(record_response(&device))
        }
        (&Method::POST, URI_UPDATE_SENSOR) => update_sensor(req, state).await,
        (&Method::GET, URI_UPDATE_SENSOR) => Ok(output_response(&Output::ok("Okay"), StatusCode::OK)),
        (&Method::POST, URI_LOGGING) => {
            let (_guard, message) = admit_and_read::<LogMessage>(&state.gate.admin, req).await?;
            state.registry.log_message(&message).await?;
            Ok(output_response(&Output::ok("Logged"), StatusCode::OK))
        }
        (_, p) if KNOWN_PATHS.contains(&p) => Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED)),
        _ => Ok(empty_response(StatusCode::NOT_FOUND)),
    }
}

/// Take `permit`, then read and decode the body. The guard is released when
/// the caller drops it.
async fn admit_and_read<T: DeserializeOwned>(
    permit: &Permit,
    req: Request<Body>,
) -> Result<(PermitGuard, T), ApiError> {
    let path = req.uri().path().to_string();
    let guard = AdmissionGate::admit(permit, &path)?;
    let bytes = to_bytes(req.into_body()).await?;
    let body = serde_json::from_slice(&bytes).map_err(|e| ApiError::Input(e.to_string()))?;
    Ok((guard, body))
}

fn validate_batch(batch: &[Series]) -> Result<(), ApiError> {
    for series in batch {
        series.validate().map_err(|e| ApiError::Input(e.to_string()))?;
    }
    Ok(())
}

async fn insert_batch(sink: &dyn TimeseriesSink, batch: &[Series]) -> Result<(), StoreError> {
    for series in batch {
        with_timeout(SUBMIT_TIMEOUT, sink.insert(series)).await?;
    }
    Ok(())
}

/// Accept a batch and persist it in the background; the permit travels with
/// the persistence task.
async fn save_timeseries(req: Request<Body>, state: &ApiState) -> Result<Response<Body>, ApiError> {
    let (guard, batch) = admit_and_read::<Vec<Series>>(&state.gate.ingest, req).await?;
    validate_batch(&batch)?;
    tracing::info!(series = batch.len(), "received timeseries batch");

    let sink = state.sink.clone();
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = insert_batch(sink.as_ref(), &batch).await {
            tracing::error!("failed to persist submitted batch: {}", e);
        }
    });
    Ok(output_response(&Output::ok("Accepted"), StatusCode::OK))
}

async fn upload_data(req: Request<Body>, state: &ApiState) -> Result<Response<Body>, ApiError> {
    let (_guard, batch) = admit_and_read::<Vec<Series>>(&state.gate.ingest, req).await?;
    validate_batch(&batch)?;
    insert_batch(state.sink.as_ref(), &batch).await?;
    Ok(output_response(&Output::ok("Success"), StatusCode::OK))
}

/// One sample per reported sensor value, annotated with the device tags.
async fn update_sensor(req: Request<Body>, state: &ApiState) -> Result<Response<Body>, ApiError> {
    let (_guard, values) = admit_and_read::<SensorValues>(&state.gate.admin, req).await?;
    let comment = values.tags.join(";");
    let now = Utc::now();
    let batch: Vec<Series> = values
        .data
        .iter()
        .map(|v| {
            let mut series = Series::single(v.name.clone(), now, v.value as f64);
            series.comments = vec![comment.clone()];
            series
        })
        .collect();
    insert_batch(state.sink.as_ref(), &batch).await?;
    Ok(output_response(&Output::ok("Success"), StatusCode::OK))
}
