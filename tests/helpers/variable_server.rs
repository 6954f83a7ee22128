use axum::{
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::put,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub query: String,
    pub token: Option<String>,
    pub body: Value,
}

impl RecordedRequest {
    pub fn op(&self) -> &str {
        self.query.split('&').next().unwrap_or_default()
    }
}

#[derive(Default)]
struct ServerState {
    holder: Option<String>,
    next_id: u64,
    fail_remaining: u32,
    fail_status: u16,
    requests: Vec<RecordedRequest>,
}

/// Fake variable service speaking the lock protocol over HTTP.
#[derive(Clone, Default)]
pub struct VariableServer {
    state: Arc<Mutex<ServerState>>,
}

impl VariableServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds to an ephemeral port and returns the base address.
    pub async fn spawn(&self) -> String {
        let app = Router::new()
            .route("/v1/var/*path", put(handle))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Answers the next `count` requests with `status`.
    pub fn fail_next(&self, count: u32, status: u16) {
        let mut state = self.state.lock().unwrap();
        state.fail_remaining = count;
        state.fail_status = status;
    }

    /// Drops the current holder as if its TTL had elapsed.
    pub fn forget_lock(&self) {
        self.state.lock().unwrap().holder = None;
    }

    pub fn holder(&self) -> Option<String> {
        self.state.lock().unwrap().holder.clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.requests().iter().filter(|r| r.op() == op).count()
    }
}

fn lock_id(body: &Value) -> Option<String> {
    body["Lock"]["ID"].as_str().map(str::to_string)
}

async fn handle(
    State(server): State<VariableServer>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = server.state.lock().unwrap();
    let request = RecordedRequest {
        path,
        query: query.unwrap_or_default(),
        token: headers
            .get("X-Nomad-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: body.clone(),
    };
    let op = request.op().to_string();
    state.requests.push(request);

    if state.fail_remaining > 0 {
        state.fail_remaining -= 1;
        let status = StatusCode::from_u16(state.fail_status).unwrap();
        return (status, Json(json!({"error": "injected failure"}))).into_response();
    }

    match op.as_str() {
        "lock-acquire" => {
            if state.holder.is_some() {
                return (StatusCode::CONFLICT, Json(json!({"error": "lock held"}))).into_response();
            }
            state.next_id += 1;
            let id = format!("lock-{}", state.next_id);
            state.holder = Some(id.clone());

            let index = state.next_id * 10;
            let mut response = body;
            response["Lock"]["ID"] = json!(id);
            response["ModifyIndex"] = json!(index);
            (
                StatusCode::OK,
                [("X-Nomad-Index", index.to_string())],
                Json(response),
            )
                .into_response()
        }
        "lock-renew" => {
            if state.holder.is_some() && state.holder == lock_id(&body) {
                let mut response = body;
                if let Some(map) = response.as_object_mut() {
                    map.remove("Items");
                }
                (StatusCode::OK, Json(response)).into_response()
            } else {
                (StatusCode::CONFLICT, Json(json!({"error": "lock not held"}))).into_response()
            }
        }
        "lock-release" => {
            if state.holder.is_some() && state.holder == lock_id(&body) {
                state.holder = None;
                (StatusCode::OK, Json(json!({}))).into_response()
            } else {
                (StatusCode::CONFLICT, Json(json!({"error": "lock not held"}))).into_response()
            }
        }
        _ => (StatusCode::BAD_REQUEST, Json(json!({"error": "unknown operation"}))).into_response(),
    }
}
