//! # HTTP Boundary
//!
//! All routes from the node's external contract: the peer handshake,
//! gossip, overlay routing, the DHT store, the scheduler and executor
//! entry points, and read-only introspection for operators and the
//! external ring visualizer.
//!
//! Every error response carries a JSON `{error}` body with a
//! conventional status: 403 for authentication failures, 400 for
//! validation failures. Handlers hold no state of their own — everything
//! goes through the shared [`Node`].

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use edgemesh_common::{ChordId, DhtUpdate, ResourceOffer, TaskDescriptor, TaskResult};

use crate::chord::{Finger, FingerAnalysis};
use crate::dht::DhtError;
use crate::offers::OffersResponse;
use crate::registry::{AuthError, PeerAddr, PeerRecord};
use crate::scheduler::{schedule_task, ScheduleOutcome};
use crate::state::Node;
use crate::transport::DISPATCH_TIMEOUT;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into()})),
    )
}

fn forbidden(message: impl Into<String>) -> ApiError {
    (StatusCode::FORBIDDEN, Json(json!({"error": message.into()})))
}

// ── Peer handshake ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub ip: String,
    pub port: u16,
    pub public_key: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub challenge: String,
}

async fn register(
    State(node): State<Arc<Node>>,
    Json(req): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    let challenge = node.registry.register(&req.ip, req.port, req.public_key);
    Json(RegisterResponse { challenge })
}

#[derive(Debug, Deserialize)]
pub struct AuthenticateRequest {
    pub ip: String,
    pub port: u16,
    pub signature: String,
    #[serde(default)]
    pub promised_capacity: u64,
}

async fn authenticate(
    State(node): State<Arc<Node>>,
    Json(req): Json<AuthenticateRequest>,
) -> Result<Json<Value>, ApiError> {
    match node
        .registry
        .authenticate(&req.ip, req.port, &req.signature, req.promised_capacity)
    {
        Ok(()) => Ok(Json(json!({"status": "Authenticated"}))),
        Err(AuthError::NotRegistered) => Err(bad_request("Peer not registered")),
        Err(AuthError::BadSignature) => Err(forbidden("Authentication Failed")),
    }
}

// ── Gossip ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerRecord>,
}

async fn peers(State(node): State<Arc<Node>>) -> Json<PeersResponse> {
    Json(PeersResponse {
        peers: node.registry.peer_list(),
    })
}

async fn update_peer(
    State(node): State<Arc<Node>>,
    Json(record): Json<PeerRecord>,
) -> Json<Value> {
    node.registry.update_peer(record);
    Json(json!({"status": "ok"}))
}

// ── Status ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub ip: String,
    pub port: u16,
    pub chord_id: ChordId,
    pub chord_id_short: u64,
    pub promised_capacity: u64,
    pub current_load: u64,
    pub esp_active: bool,
    pub total_earnings_usd: f64,
    pub active_tasks: usize,
}

async fn status(State(node): State<Arc<Node>>) -> Json<StatusResponse> {
    let addr = node.addr();
    let load = node.current_load.load(Ordering::SeqCst);
    Json(StatusResponse {
        ip: addr.ip.clone(),
        port: addr.port,
        chord_id: addr.chord_id,
        chord_id_short: addr.chord_id.short(),
        promised_capacity: node.promised_capacity,
        current_load: load,
        esp_active: load > 0,
        total_earnings_usd: node.total_earnings_usd(),
        active_tasks: node.allocations.active(),
    })
}

// ── Overlay routing ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IdQuery {
    id: String,
}

async fn find_successor(
    State(node): State<Arc<Node>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<PeerAddr>, ApiError> {
    let id = ChordId::from_hex(&query.id)
        .map_err(|_| bad_request(format!("invalid id {:?}", query.id)))?;
    let found = node
        .overlay
        .find_successor(&id, &node.transport, &node.registry)
        .await;
    Ok(Json(found))
}

async fn successor(State(node): State<Arc<Node>>) -> Json<Option<PeerAddr>> {
    Json(node.overlay.successor())
}

async fn predecessor(State(node): State<Arc<Node>>) -> Json<Option<PeerAddr>> {
    Json(node.overlay.predecessor())
}

async fn notify(
    State(node): State<Arc<Node>>,
    Json(candidate): Json<PeerAddr>,
) -> Json<Value> {
    node.overlay.notify(candidate);
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Serialize)]
pub struct FingerTableResponse {
    pub node_id: ChordId,
    pub fingers: Vec<Finger>,
}

async fn finger_table(State(node): State<Arc<Node>>) -> Json<FingerTableResponse> {
    Json(FingerTableResponse {
        node_id: node.chord_id(),
        fingers: node.overlay.finger_sample(20),
    })
}

async fn fix_fingers(State(node): State<Arc<Node>>) -> Json<Value> {
    let worker = node.clone();
    tokio::spawn(async move {
        worker
            .overlay
            .fix_first_fingers(&worker.transport, &worker.registry)
            .await;
    });
    Json(json!({"status": "Finger table fix initiated"}))
}

async fn analyze(State(node): State<Arc<Node>>) -> Json<FingerAnalysis> {
    Json(node.overlay.analyze())
}

// ── DHT store ───────────────────────────────────────────────────────

async fn store_metadata(
    State(node): State<Arc<Node>>,
    Json(update): Json<DhtUpdate>,
) -> Result<Json<Value>, ApiError> {
    match node.dht.store_update(update, &node.registry) {
        Ok(()) => Ok(Json(json!({"status": "stored"}))),
        Err(e @ DhtError::UnknownPublisher(_)) => Err(forbidden(e.to_string())),
        Err(e @ DhtError::BadEnvelopeSignature) => Err(forbidden(e.to_string())),
        Err(e @ DhtError::BadOfferSignature) => Err(forbidden(e.to_string())),
        Err(e @ DhtError::NotResponsible(_)) => Err(bad_request(e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    key: String,
}

async fn lookup_metadata(
    State(node): State<Arc<Node>>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<OffersResponse>, ApiError> {
    let key = ChordId::from_hex(&query.key)
        .map_err(|_| bad_request(format!("invalid key {:?}", query.key)))?;
    let predecessor = node.overlay.predecessor();
    match node.dht.lookup(
        &key,
        &node.chord_id(),
        predecessor.as_ref().map(|p| &p.chord_id),
    ) {
        Ok(offers) => Ok(Json(OffersResponse { offers })),
        Err(e) => Err(bad_request(e.to_string())),
    }
}

// ── Offers ──────────────────────────────────────────────────────────

async fn resource_offer(
    State(node): State<Arc<Node>>,
) -> Result<Json<ResourceOffer>, ApiError> {
    node.current_offer()
        .map(Json)
        .map_err(|e| bad_request(e.to_string()))
}

// ── Scheduler & executor ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubmitQuery {
    #[serde(default)]
    redundant_k: Option<usize>,
}

async fn submit_task(
    State(node): State<Arc<Node>>,
    Query(query): Query<SubmitQuery>,
    Json(task): Json<TaskDescriptor>,
) -> Json<ScheduleOutcome> {
    let k = query.redundant_k.unwrap_or(1);
    Json(schedule_task(&node, task, k).await)
}

#[derive(Debug, Serialize)]
pub struct ExecuteAck {
    pub task_id: uuid::Uuid,
    pub status: &'static str,
}

async fn execute_task(
    State(node): State<Arc<Node>>,
    Json(task): Json<TaskDescriptor>,
) -> Json<ExecuteAck> {
    let task_id = task.task_id;
    node.journal.append(
        "TASK_ACCEPTED_BY_NODE_X",
        &task_id.to_string(),
        &node.endpoint(),
        json!({"task_type": task.payload.kind()}),
    );
    let worker = node.clone();
    tokio::spawn(async move {
        crate::executor::run_task(worker, task).await;
    });
    Json(ExecuteAck {
        task_id,
        status: "accepted",
    })
}

async fn task_result(
    State(node): State<Arc<Node>>,
    Json(result): Json<TaskResult>,
) -> Json<Value> {
    if node.collector.deliver(result) {
        Json(json!({"status": "received"}))
    } else {
        Json(json!({"status": "ignored"}))
    }
}

// ── Legacy load forwarding ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HandleRequest {
    #[serde(default = "default_processing_load")]
    pub processing_load: u64,
    #[serde(default)]
    #[allow(dead_code)]
    pub task_type: Option<String>,
}

fn default_processing_load() -> u64 {
    10
}

async fn handle_request(
    State(node): State<Arc<Node>>,
    Json(req): Json<HandleRequest>,
) -> Json<Value> {
    let load = node
        .current_load
        .fetch_add(req.processing_load, Ordering::SeqCst)
        + req.processing_load;
    info!(
        "load packet of {} units, now {}/{}",
        req.processing_load, load, node.promised_capacity
    );
    node.registry.update_self(node.promised_capacity, load);

    if load > node.promised_capacity {
        // Over capacity: redirect to the first peer with headroom.
        let candidate = node
            .registry
            .other_peers()
            .into_iter()
            .find(|p| p.current_load < p.promised_capacity
                && !node.registry.is_quarantined(&p.endpoint()));
        if let Some(peer) = candidate {
            let url = format!("{}/handle_request", peer.addr().base_url());
            let body = json!({"processing_load": req.processing_load});
            match node
                .transport
                .post_json_ack(&url, &body, DISPATCH_TIMEOUT)
                .await
            {
                Ok(()) => return Json(json!({"redirected": peer.endpoint()})),
                Err(_) => {
                    node.registry.mark_misbehavior(&peer.endpoint());
                    info!("forward failed, accepting locally");
                }
            }
        }
    }
    Json(json!({"status": "Accepted locally"}))
}

// ── Journal ─────────────────────────────────────────────────────────

async fn logs(State(node): State<Arc<Node>>) -> Result<String, ApiError> {
    node.journal
        .contents()
        .map_err(|e| bad_request(e.to_string()))
}

/// Builds the full route table over the shared node state.
pub fn build_router(node: Arc<Node>) -> Router {
    Router::new()
        // Peer handshake & gossip
        .route("/register", post(register))
        .route("/authenticate", post(authenticate))
        .route("/peer", get(peers))
        .route("/update_peer", post(update_peer))
        // Introspection
        .route("/status", get(status))
        .route("/logs", get(logs))
        // Overlay
        .route("/chord/find_successor", get(find_successor))
        .route("/chord/successor", get(successor))
        .route("/chord/predecessor", get(predecessor))
        .route("/chord/notify", post(notify))
        .route("/chord/finger_table", get(finger_table))
        .route("/chord/fix_fingers", post(fix_fingers))
        .route("/chord/analyze", get(analyze))
        // DHT
        .route("/chord/store_metadata", post(store_metadata))
        .route("/chord/lookup_metadata", get(lookup_metadata))
        // Offers & marketplace
        .route("/resource_offer", get(resource_offer))
        .route("/submit_task", post(submit_task))
        .route("/execute_task", post(execute_task))
        .route("/task_result", post(task_result))
        .route("/handle_request", post(handle_request))
        .with_state(node)
}
