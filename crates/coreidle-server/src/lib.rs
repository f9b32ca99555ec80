//! HTTP control plane for coreidle.
//!
//! Carries the command endpoint over HTTP: idle commands and register reads
//! as JSON, plus the fixed-size binary records of the wire channels as raw
//! request bodies.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use coreidle_core::hw::msr::parse_register;
use coreidle_core::wire::REGISTER_RECORD_LEN;
use coreidle_core::{
    AperfMperf, CommandEndpoint, CoreMask, IdleChannel, IdleRequest, IdleState, LaunchReport,
    RegisterChannel, RegisterRequest, RegisterResponse, RejectReason,
};

/// Shared server state.
struct AppState {
    endpoint: CommandEndpoint,
}

type Shared = State<Arc<AppState>>;

/// State as a wire id (`6`) or a name (`"c6"`).
#[derive(Deserialize)]
#[serde(untagged)]
enum StateField {
    Id(u8),
    Name(String),
}

#[derive(Deserialize)]
struct IdleBody {
    /// Explicit core list. Takes precedence over `mask`.
    cores: Option<Vec<u32>>,
    /// Core list or hex mask string, e.g. `"0,2"` or `"0x5"`.
    mask: Option<String>,
    state: StateField,
    duration_us: u32,
}

#[derive(Deserialize)]
struct IdleParams {
    /// Hold the response until the launch has finished.
    wait: Option<bool>,
}

#[derive(Serialize, Default)]
struct IdleResponse {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cores: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<IdleState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_us: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<LaunchReport>,
}

impl IdleResponse {
    fn rejected(reason: RejectReason, detail: Option<String>) -> (StatusCode, Json<Self>) {
        let status = match reason {
            RejectReason::AllocationFailure => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        };
        let text = match detail {
            Some(d) => format!("{reason}: {d}"),
            None => reason.to_string(),
        };
        (
            status,
            Json(Self {
                code: Some(reason.code()),
                reason: Some(text),
                ..Self::default()
            }),
        )
    }
}

#[derive(Deserialize)]
struct RegisterParams {
    core: u32,
    /// `0xE7`, `e7h` or decimal.
    register: String,
}

#[derive(Deserialize)]
struct CoreParams {
    core: u32,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn bad_request(error: String) -> (StatusCode, Json<ErrorBody>) {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error }))
}

fn internal(error: impl std::fmt::Display) -> (StatusCode, Json<ErrorBody>) {
    log::error!("{error}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
}

fn idle_request(body: &IdleBody) -> Result<IdleRequest, (RejectReason, Option<String>)> {
    let core_mask = match (&body.cores, &body.mask) {
        (Some(cores), _) => {
            let mut mask = CoreMask::new();
            for &core in cores {
                if !mask.set(core) {
                    return Err((RejectReason::CoreOutOfRange, None));
                }
            }
            mask
        }
        (None, Some(mask)) => mask
            .parse()
            .map_err(|e| (RejectReason::MalformedRequest, Some(e)))?,
        (None, None) => {
            return Err((
                RejectReason::MalformedRequest,
                Some("give `cores` or `mask`".to_string()),
            ));
        }
    };
    let state = match &body.state {
        StateField::Id(id) => *id,
        StateField::Name(name) => name
            .parse::<IdleState>()
            .map_err(|_| (RejectReason::InvalidState, None))?
            .id(),
    };
    Ok(IdleRequest {
        core_mask,
        state,
        duration_us: body.duration_us,
    })
}

async fn handle_idle(
    State(state): Shared,
    Query(params): Query<IdleParams>,
    Json(body): Json<IdleBody>,
) -> (StatusCode, Json<IdleResponse>) {
    let request = match idle_request(&body) {
        Ok(r) => r,
        Err((reason, detail)) => return IdleResponse::rejected(reason, detail),
    };
    let accepted = match state.endpoint.submit_idle_command(&request) {
        Ok(a) => a,
        Err(reason) => return IdleResponse::rejected(reason, None),
    };

    let mut response = IdleResponse {
        accepted: true,
        id: Some(accepted.id.to_string()),
        cores: accepted.cores.cores().collect(),
        state: Some(accepted.state),
        duration_us: Some(accepted.duration_us),
        ..IdleResponse::default()
    };

    if !params.wait.unwrap_or(false) {
        return (StatusCode::ACCEPTED, Json(response));
    }

    let handle = accepted.handle;
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(report)) => {
            response.report = Some(report);
            (StatusCode::OK, Json(response))
        }
        _ => {
            log::error!(
                "launch {} did not report",
                response.id.as_deref().unwrap_or("?")
            );
            response.reason = Some("launch thread failed".to_string());
            (StatusCode::INTERNAL_SERVER_ERROR, Json(response))
        }
    }
}

async fn handle_register(
    State(state): Shared,
    Query(params): Query<RegisterParams>,
) -> Result<Json<RegisterResponse>, (StatusCode, Json<ErrorBody>)> {
    let register = parse_register(&params.register).map_err(bad_request)?;
    let request = RegisterRequest {
        core: params.core,
        register,
    };
    let endpoint = state.endpoint.clone();
    tokio::task::spawn_blocking(move || endpoint.submit_register_read(&request))
        .await
        .map(Json)
        .map_err(internal)
}

async fn handle_aperf_mperf(
    State(state): Shared,
    Query(params): Query<CoreParams>,
) -> Result<Json<AperfMperf>, (StatusCode, Json<ErrorBody>)> {
    let endpoint = state.endpoint.clone();
    tokio::task::spawn_blocking(move || endpoint.read_aperf_mperf(params.core))
        .await
        .map(Json)
        .map_err(internal)
}

/// Body is one 76-byte idle-state record.
async fn handle_idle_raw(
    State(state): Shared,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    match IdleChannel::new(&state.endpoint).submit(&body) {
        Ok(accepted) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "bytes": body.len(),
                "id": accepted.id.to_string(),
            })),
        ),
        Err(reason) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "code": reason.code(),
                "reason": reason.to_string(),
            })),
        ),
    }
}

/// Body is one 24-byte register record; the response body is the answer record.
async fn handle_register_raw(State(state): Shared, body: Bytes) -> Response {
    let endpoint = state.endpoint.clone();
    let result = tokio::task::spawn_blocking(move || {
        let channel = RegisterChannel::new(&endpoint);
        channel.write(&body)?;
        let mut out = vec![0u8; REGISTER_RECORD_LEN];
        let n = channel.read(&mut out)?;
        out.truncate(n);
        Ok::<_, coreidle_core::WireError>(out)
    })
    .await;

    match result {
        Ok(Ok(record)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            record,
        )
            .into_response(),
        Ok(Err(e)) => bad_request(e.to_string()).into_response(),
        Err(e) => internal(e).into_response(),
    }
}

async fn handle_cores(State(state): Shared) -> Json<serde_json::Value> {
    let orch = state.endpoint.orchestrator();
    Json(serde_json::json!({
        "online": orch.online_cores(),
        "platform": orch.platform().describe(),
        "cores": state.endpoint.core_status(),
    }))
}

async fn handle_health(State(state): Shared) -> Json<serde_json::Value> {
    let orch = state.endpoint.orchestrator();
    let cache = orch.cache();
    Json(serde_json::json!({
        "status": if orch.is_closed() { "closed" } else { "ok" },
        "cores": orch.slots().len(),
        "waiting": orch.waiting_cores(),
        "sample_cache": {
            "capacity": cache.capacity(),
            "used": cache.len(),
        },
    }))
}

async fn handle_index(State(state): Shared) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "coreidle server",
        "version": coreidle_core::VERSION,
        "platform": state.endpoint.orchestrator().platform().describe(),
        "endpoints": {
            "/": "This API index",
            "/health": "Health check",
            "/cores": "Per-core phase, launches and last worker report",
            "/api/v1/idle": {
                "method": "POST",
                "body": "{\"cores\": [0, 2] | \"mask\": \"0x5\", \"state\": 6 | \"c6\", \"duration_us\": 2000}",
                "params": { "wait": "true to answer with the launch report" },
            },
            "/api/v1/register": {
                "method": "GET",
                "params": { "core": "Core id", "register": "Register address, e.g. 0xE7" },
            },
            "/api/v1/aperf-mperf": {
                "method": "GET",
                "params": { "core": "Core id" },
            },
            "/api/v1/idle/raw": "POST one 76-byte idle-state record",
            "/api/v1/register/raw": "POST one 24-byte register record, answered with a record",
        },
    }))
}

/// Build the axum router.
fn build_router(endpoint: CommandEndpoint) -> Router {
    let state = Arc::new(AppState { endpoint });
    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/cores", get(handle_cores))
        .route("/api/v1/idle", post(handle_idle))
        .route("/api/v1/idle/raw", post(handle_idle_raw))
        .route("/api/v1/register", get(handle_register))
        .route("/api/v1/register/raw", post(handle_register_raw))
        .route("/api/v1/aperf-mperf", get(handle_aperf_mperf))
        .with_state(state)
}

/// Serve `endpoint` on `host:port` until `shutdown` resolves.
pub async fn run_server(
    endpoint: CommandEndpoint,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_router(endpoint);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::sync::Mutex;

    use coreidle_core::hw::PollWait;
    use coreidle_core::hw::msr::MSR_IA32_MPERF;
    use coreidle_core::wire::{IdleRecord, RegisterRecord};
    use coreidle_core::{
        CpuTopology, EngineConfig, Orchestrator, Platform, RegisterAccess, RegisterError,
    };

    #[derive(Default)]
    struct MockRegisters(Mutex<HashMap<(u32, u32), u64>>);

    impl RegisterAccess for MockRegisters {
        fn name(&self) -> &'static str {
            "mock"
        }
        fn read(&self, core: u32, register: u32) -> Result<u64, RegisterError> {
            self.0
                .lock()
                .unwrap()
                .get(&(core, register))
                .copied()
                .ok_or(RegisterError::Unmapped { core, register })
        }
    }

    struct FourCores;

    impl CpuTopology for FourCores {
        fn online_cores(&self) -> usize {
            4
        }
        fn pin_current_thread(&self, _core: u32) -> io::Result<()> {
            Ok(())
        }
        fn is_current_thread_pinned_to(&self, _core: u32) -> bool {
            false
        }
    }

    fn state() -> Arc<AppState> {
        let registers = MockRegisters::default();
        registers.0.lock().unwrap().insert((1, MSR_IA32_MPERF), 4242);
        let config = EngineConfig::default();
        let platform = Platform {
            registers: Arc::new(registers),
            wait: Arc::new(PollWait::new(std::time::Duration::from_micros(100))),
            topology: Arc::new(FourCores),
        };
        Arc::new(AppState {
            endpoint: CommandEndpoint::new(Orchestrator::new(config, platform)),
        })
    }

    fn idle_body(json: serde_json::Value) -> Json<IdleBody> {
        Json(serde_json::from_value(json).unwrap())
    }

    #[tokio::test]
    async fn idle_json_with_wait_returns_report() {
        let (status, Json(resp)) = handle_idle(
            State(state()),
            Query(IdleParams { wait: Some(true) }),
            idle_body(serde_json::json!({"cores": [0, 2], "state": "c6", "duration_us": 2000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(resp.accepted);
        assert_eq!(resp.cores, vec![0, 2]);
        assert_eq!(resp.report.unwrap().launched_cores(), vec![0, 2]);
    }

    #[tokio::test]
    async fn idle_json_fire_and_forget() {
        let (status, Json(resp)) = handle_idle(
            State(state()),
            Query(IdleParams { wait: None }),
            idle_body(serde_json::json!({"mask": "0x5", "state": 1, "duration_us": 100})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(resp.id.is_some());
        assert!(resp.report.is_none());
    }

    #[tokio::test]
    async fn idle_json_rejections_carry_codes() {
        let s = state();
        let (status, Json(resp)) = handle_idle(
            State(s.clone()),
            Query(IdleParams { wait: None }),
            idle_body(serde_json::json!({"cores": [0], "state": 99, "duration_us": 100})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!resp.accepted);
        assert_eq!(resp.code, Some(RejectReason::InvalidState.code()));

        let (_, Json(resp)) = handle_idle(
            State(s.clone()),
            Query(IdleParams { wait: None }),
            idle_body(serde_json::json!({"cores": [7], "state": "c1", "duration_us": 100})),
        )
        .await;
        assert_eq!(resp.code, Some(RejectReason::CoreOutOfRange.code()));

        let (_, Json(resp)) = handle_idle(
            State(s),
            Query(IdleParams { wait: None }),
            idle_body(serde_json::json!({"state": "c1", "duration_us": 100})),
        )
        .await;
        assert_eq!(resp.code, Some(RejectReason::MalformedRequest.code()));
    }

    #[tokio::test]
    async fn register_query_parses_hex() {
        let Json(resp) = handle_register(
            State(state()),
            Query(RegisterParams {
                core: 1,
                register: "0xE7".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.value, 4242);
        assert!(resp.ready);

        let err = handle_register(
            State(state()),
            Query(RegisterParams {
                core: 1,
                register: "mperf".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn raw_idle_record() {
        let record = IdleRecord::from_request(&IdleRequest {
            core_mask: CoreMask::from_u64(0b10),
            state: 3,
            duration_us: 50,
        })
        .encode();
        let (status, Json(v)) =
            handle_idle_raw(State(state()), Bytes::copy_from_slice(&record)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(v["bytes"], 76);

        let (status, Json(v)) =
            handle_idle_raw(State(state()), Bytes::copy_from_slice(&record[..10])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(v["code"], RejectReason::MalformedRequest.code());
    }

    #[tokio::test]
    async fn raw_register_record() {
        let request = RegisterRecord::request(1, MSR_IA32_MPERF).encode();
        let response =
            handle_register_raw(State(state()), Bytes::copy_from_slice(&request)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let record = RegisterRecord::decode(&body).unwrap();
        assert_eq!(record.value, 4242);
        assert!(record.ready);
    }

    #[tokio::test]
    async fn health_and_cores() {
        let s = state();
        let Json(health) = handle_health(State(s.clone())).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["cores"], 4);
        let Json(cores) = handle_cores(State(s)).await;
        assert_eq!(cores["cores"].as_array().unwrap().len(), 4);
        assert_eq!(cores["cores"][0]["phase"], "idle");
    }

    #[test]
    fn router_builds() {
        let _ = build_router(state().endpoint.clone());
    }
}
