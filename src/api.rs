//! HTTP handlers: the gateway webhook plus the dashboard surface.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::{AppError, StoreError};
use crate::routing::dangling_references;
use crate::service::IngestOutcome;
use crate::types::{
    customer_transcript, ClearLeadsBody, CreateFlowBody, FlowConfig, FlowStep, HandoffBody,
    KeywordRule, PatchLeadBody, SendFileBody, SendTextBody, UpdateFlowBody,
};
use crate::validation::{parse_webhook, ValidationError};

type ApiResult<T> = Result<T, AppError>;

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn verify_signature(secret: &str, signature_header: &str, body: &[u8]) -> bool {
    let signature = signature_header.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Shared secret header, or an HMAC-SHA256 signature of the raw body.
pub fn webhook_authorised(secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
    if let Some(provided) = headers.get("x-webhook-secret").and_then(|v| v.to_str().ok()) {
        return constant_time_eq(provided.trim().as_bytes(), secret.as_bytes());
    }
    headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|signature| verify_signature(secret, signature, body))
}

fn require_dashboard(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.config.dashboard_token.as_deref() else {
        return Ok(());
    };
    match bearer_token(headers) {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<IngestOutcome>> {
    if !webhook_authorised(&state.config.webhook_secret, &headers, &body) {
        tracing::warn!("webhook rejected: bad secret or signature");
        return Err(AppError::Unauthorized);
    }
    let raw = serde_json::from_slice::<Value>(&body)
        .map_err(|err| ValidationError::new("$", format!("body is not valid JSON: {err}")))?;
    let envelope = parse_webhook(raw).inspect_err(|err| {
        tracing::info!(field = %err.path, message = %err.message, "webhook payload rejected");
    })?;
    let outcome = state.orchestrator.ingest(envelope).await?;
    Ok(Json(outcome))
}

pub async fn get_messages(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let store = state.orchestrator.store();
    if store.get_conversation(&conversation_id).await?.is_none() {
        return Err(AppError::NotFound("conversation"));
    }
    let messages = customer_transcript(&store.list_messages(&conversation_id).await?);
    Ok(Json(json!({ "messages": messages })))
}

pub async fn send_text(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendTextBody>,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let message = state
        .orchestrator
        .send_manual_text(&conversation_id, &body.text)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "message": message }))))
}

pub async fn send_file(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendFileBody>,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let (message, paused) = state
        .orchestrator
        .send_manual_file(&conversation_id, body)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": message, "pausedAutomation": paused })),
    ))
}

pub async fn patch_handoff(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<HandoffBody>,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let conversation = state
        .orchestrator
        .set_handoff(&conversation_id, body.active)
        .await?;
    Ok(Json(json!({ "conversation": conversation })))
}

pub async fn close_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let conversation = state.orchestrator.close_conversation(&conversation_id).await?;
    Ok(Json(json!({ "conversation": conversation })))
}

pub async fn patch_lead(
    Path(lead_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PatchLeadBody>,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    if body.status.is_none() && body.priority.is_none() {
        return Err(AppError::BadRequest("status or priority required".into()));
    }
    let lead = state
        .orchestrator
        .update_lead_tags(&lead_id, body.status, body.priority)
        .await?;
    Ok(Json(json!({ "lead": lead })))
}

pub async fn clear_leads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ClearLeadsBody>,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let removed = state.orchestrator.clear_leads(&body.password).await?;
    Ok(Json(json!({ "removed": removed })))
}

pub async fn debug_buffer(
    Path(phone): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let (phone, conversation_id, window) = state.orchestrator.buffer_debug(&phone).await?;
    Ok(Json(json!({
        "phone": phone,
        "conversationId": conversation_id,
        "currentStep": window.current_step,
        "bufferSeconds": window.buffer_seconds,
        "source": window.source,
    })))
}

async fn load_flow(state: &AppState, flow_id: &str) -> ApiResult<FlowConfig> {
    state
        .orchestrator
        .store()
        .get_flow(flow_id)
        .await?
        .ok_or(AppError::NotFound("flow"))
}

/// Bumps the version and persists an edited flow.
async fn save_revision(state: &AppState, mut flow: FlowConfig) -> ApiResult<FlowConfig> {
    flow.version += 1;
    flow.updated_at = Utc::now();
    state.orchestrator.store().save_flow(&flow).await?;
    tracing::info!(flow_id = %flow.id, version = flow.version, "flow saved");
    Ok(flow)
}

fn with_id(id: &str) -> String {
    if id.trim().is_empty() {
        Uuid::new_v4().to_string()
    } else {
        id.trim().to_string()
    }
}

pub async fn list_flows(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let flows = state.orchestrator.store().list_flows().await?;
    Ok(Json(json!({ "flows": flows })))
}

pub async fn create_flow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateFlowBody>,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest("name required".into()));
    }

    let mut steps = Vec::with_capacity(body.steps.len());
    for mut step in body.steps {
        step.id = with_id(&step.id);
        if steps.iter().any(|existing: &FlowStep| existing.id == step.id) {
            return Err(AppError::BadRequest(format!("duplicate step id '{}'", step.id)));
        }
        steps.push(step);
    }
    let keywords = body
        .keywords
        .into_iter()
        .map(|rule| KeywordRule {
            id: with_id(&rule.id),
            ..rule
        })
        .collect();

    let now = Utc::now();
    let flow = FlowConfig {
        id: Uuid::new_v4().to_string(),
        name,
        version: 1,
        global_prompt: body.global_prompt,
        active: false,
        steps,
        keywords,
        created_at: now,
        updated_at: now,
    };
    state.orchestrator.store().save_flow(&flow).await?;
    tracing::info!(flow_id = %flow.id, "flow created");
    Ok((StatusCode::CREATED, Json(json!({ "flow": flow }))))
}

pub async fn get_flow(
    Path(flow_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let flow = load_flow(&state, &flow_id).await?;
    Ok(Json(json!({ "flow": flow })))
}

pub async fn update_flow(
    Path(flow_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateFlowBody>,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let mut flow = load_flow(&state, &flow_id).await?;
    if let Some(name) = body.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::BadRequest("name required".into()));
        }
        flow.name = name;
    }
    if let Some(global_prompt) = body.global_prompt {
        flow.global_prompt = global_prompt;
    }
    let flow = save_revision(&state, flow).await?;
    Ok(Json(json!({ "flow": flow })))
}

pub async fn add_step(
    Path(flow_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut step): Json<FlowStep>,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let mut flow = load_flow(&state, &flow_id).await?;
    step.id = with_id(&step.id);
    if flow.has_step(&step.id) {
        return Err(AppError::BadRequest(format!("step '{}' already exists", step.id)));
    }
    flow.steps.push(step.clone());
    save_revision(&state, flow).await?;
    Ok((StatusCode::CREATED, Json(json!({ "step": step }))))
}

pub async fn put_step(
    Path((flow_id, step_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut step): Json<FlowStep>,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let mut flow = load_flow(&state, &flow_id).await?;
    step.id = step_id;
    let slot = flow
        .steps
        .iter_mut()
        .find(|existing| existing.id == step.id)
        .ok_or(AppError::NotFound("step"))?;
    *slot = step.clone();
    save_revision(&state, flow).await?;
    Ok(Json(json!({ "step": step })))
}

pub async fn delete_step(
    Path((flow_id, step_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let mut flow = load_flow(&state, &flow_id).await?;
    let before = flow.steps.len();
    flow.steps.retain(|step| step.id != step_id);
    if flow.steps.len() == before {
        return Err(AppError::NotFound("step"));
    }
    // Rules scoped to the removed step can never fire again.
    flow.keywords
        .retain(|rule| rule.step_id.as_deref() != Some(step_id.as_str()));
    let flow = save_revision(&state, flow).await?;
    Ok(Json(json!({ "flow": flow })))
}

pub async fn add_keyword(
    Path(flow_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(rule): Json<KeywordRule>,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    if rule.keyword.trim().is_empty() {
        return Err(AppError::BadRequest("keyword required".into()));
    }
    let mut flow = load_flow(&state, &flow_id).await?;
    let rule = KeywordRule {
        id: with_id(&rule.id),
        ..rule
    };
    if flow.keywords.iter().any(|existing| existing.id == rule.id) {
        return Err(AppError::BadRequest(format!("keyword rule '{}' already exists", rule.id)));
    }
    flow.keywords.push(rule.clone());
    save_revision(&state, flow).await?;
    Ok((StatusCode::CREATED, Json(json!({ "keyword": rule }))))
}

pub async fn delete_keyword(
    Path((flow_id, rule_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let mut flow = load_flow(&state, &flow_id).await?;
    let before = flow.keywords.len();
    flow.keywords.retain(|rule| rule.id != rule_id);
    if flow.keywords.len() == before {
        return Err(AppError::NotFound("keyword rule"));
    }
    let flow = save_revision(&state, flow).await?;
    Ok(Json(json!({ "flow": flow })))
}

pub async fn activate_flow(
    Path(flow_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let flow = state
        .orchestrator
        .store()
        .activate_flow(&flow_id)
        .await
        .map_err(|err| match err {
            StoreError::NotFound(_) => AppError::NotFound("flow"),
            other => other.into(),
        })?;
    tracing::info!(flow_id = %flow.id, "flow activated");
    Ok(Json(json!({ "flow": flow })))
}

pub async fn validate_flow(
    Path(flow_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_dashboard(&state, &headers)?;
    let flow = load_flow(&state, &flow_id).await?;
    let dangling = dangling_references(&flow);
    Ok(Json(json!({
        "flowId": flow.id,
        "valid": dangling.is_empty(),
        "dangling": dangling,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    conversation_id: Option<String>,
    token: Option<String>,
}

/// Browsers cannot set headers on a WebSocket handshake, so the dashboard
/// token may also arrive as `?token=`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> ApiResult<impl IntoResponse> {
    if let Some(expected) = state.config.dashboard_token.as_deref() {
        let token = bearer_token(&headers).or(query.token);
        if !token.is_some_and(|token| constant_time_eq(token.as_bytes(), expected.as_bytes())) {
            return Err(AppError::Unauthorized);
        }
    }
    let realtime = state.orchestrator.realtime().clone();
    let filter = query.conversation_id.filter(|id| !id.trim().is_empty());
    Ok(ws.on_upgrade(move |socket| async move {
        realtime.serve_socket(socket, filter).await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::build_router;
    use crate::memory_store::MemoryStore;
    use crate::realtime::Realtime;
    use crate::service::{Collaborators, Orchestrator};
    use crate::store::Store;
    use crate::testing::{
        customer_payload, fixed_step, flow, group_payload, test_config, RecordingGateway,
        ScriptedAi, StubTranscriber, TEST_SECRET,
    };
    use axum::{body::Body, http::Request, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Api {
        router: Router,
        store: Arc<MemoryStore>,
    }

    fn api(extra: &[(&str, &str)]) -> Api {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(test_config(extra));
        let orchestrator = Orchestrator::new(
            config.clone(),
            Collaborators {
                store: store.clone(),
                gateway: RecordingGateway::new(),
                ai: ScriptedAi::new(),
                transcriber: StubTranscriber::returning("ok"),
            },
            Arc::new(Realtime::new()),
        );
        let router = build_router(Arc::new(AppState {
            config,
            orchestrator,
        }));
        Api { router, store }
    }

    async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn webhook_request(body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .header("x-webhook-secret", TEST_SECRET)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn webhook_requires_secret_or_signature() {
        let api = api(&[]);
        let payload = customer_payload("m1", "5511988887777", "Olá");
        let raw = payload.to_string();

        let unsigned = json_request("POST", "/webhook", payload.clone());
        assert_eq!(call(&api.router, unsigned).await.0, StatusCode::UNAUTHORIZED);

        let mut mac = Hmac::<Sha256>::new_from_slice(TEST_SECRET.as_bytes()).unwrap();
        mac.update(raw.as_bytes());
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        let signed = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("x-hub-signature-256", signature)
            .body(Body::from(raw))
            .unwrap();
        let (status, body) = call(&api.router, signed).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "processed");
    }

    #[tokio::test]
    async fn webhook_status_contract() {
        let api = api(&[]);

        let (status, body) = call(&api.router, webhook_request(&group_payload("g1"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ignored", "reason": "group-message-not-supported" }));

        let (status, body) = call(&api.router, webhook_request(&json!({ "hello": "world" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "$");

        let mut missing_id = customer_payload("m1", "5511988887777", "Olá");
        missing_id["payload"]
            .as_object_mut()
            .unwrap()
            .remove("id");
        let (status, body) = call(&api.router, webhook_request(&missing_id)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "payload.id");

        let mut unknown = customer_payload("m2", "5511988887777", "Olá");
        unknown["session"] = json!("nope");
        let (status, _) = call(&api.router, webhook_request(&unknown)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dashboard_token_guards_routes() {
        let api = api(&[("DASHBOARD_TOKEN", "dash")]);

        let (status, _) = call(
            &api.router,
            Request::builder().uri("/flows").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(
            &api.router,
            Request::builder()
                .uri("/flows")
                .header("authorization", "Bearer dash")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["flows"], json!([]));

        let (status, _) = call(
            &api.router,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn flow_lifecycle_keeps_fixed_prompts_as_arrays() {
        let api = api(&[]);

        let (status, body) = call(
            &api.router,
            json_request(
                "POST",
                "/flows",
                json!({
                    "name": "Seguros",
                    "globalPrompt": "Seja cordial.",
                    "steps": [
                        { "id": "welcome", "name": "Boas-vindas", "stepType": "fixed",
                          "prompt": "Olá!", "transitions": [{ "label": "segue", "targetStepId": "triage" }] },
                        { "id": "triage", "name": "Triagem", "stepType": "ai", "prompt": "Descubra o seguro",
                          "transitions": [{ "label": "fantasma", "targetStepId": "ghost" }] }
                    ]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["flow"]["version"], 1);
        assert_eq!(body["flow"]["steps"][0]["prompt"], json!(["Olá!"]));
        let flow_id = body["flow"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &api.router,
            json_request(
                "PUT",
                &format!("/flows/{flow_id}/steps/welcome"),
                json!({ "name": "Boas-vindas", "stepType": "fixed", "prompt": "Oi de novo" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["step"]["prompt"], json!(["Oi de novo"]));

        let (_, body) = call(
            &api.router,
            Request::builder()
                .uri(format!("/flows/{flow_id}/validate"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(body["valid"], false);
        assert_eq!(body["dangling"][0]["targetStepId"], "ghost");

        let (status, body) = call(
            &api.router,
            json_request("POST", &format!("/flows/{flow_id}/activate"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["flow"]["active"], true);

        let stored = api.store.active_flow().await.unwrap().unwrap();
        assert_eq!(stored.id, flow_id);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn activation_is_exclusive() {
        let api = api(&[]);
        let mut first = flow("a", vec![fixed_step("s", &["x"], &[])], vec![]);
        first.active = true;
        let mut second = flow("b", vec![fixed_step("s", &["y"], &[])], vec![]);
        second.active = false;
        api.store.save_flow(&first).await.unwrap();
        api.store.save_flow(&second).await.unwrap();

        let (status, _) = call(&api.router, json_request("POST", "/flows/b/activate", json!({}))).await;
        assert_eq!(status, StatusCode::OK);

        let flows = api.store.list_flows().await.unwrap();
        assert_eq!(flows.iter().filter(|flow| flow.active).count(), 1);
        assert_eq!(api.store.active_flow().await.unwrap().unwrap().id, "b");

        let (status, _) = call(&api.router, json_request("POST", "/flows/zzz/activate", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn transcript_hides_system_messages_and_debug_reports_buffer() {
        let api = api(&[]);
        let (status, _) = call(
            &api.router,
            webhook_request(&customer_payload("m1", "5511988887777", "Olá")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let lead = api.store.find_lead_by_phone("5511988887777").await.unwrap().unwrap();
        let conversation = api.store.find_open_conversation(&lead.id).await.unwrap().unwrap();

        let (status, _) = call(
            &api.router,
            json_request(
                "PATCH",
                &format!("/conversations/{}/handoff", conversation.id),
                json!({ "active": true }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(
            &api.router,
            Request::builder()
                .uri(format!("/conversations/{}/messages", conversation.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"], "Olá");

        let (status, body) = call(
            &api.router,
            Request::builder()
                .uri("/debug/buffer/5511988887777")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bufferSeconds"], 5);
        assert_eq!(body["source"], "default");
        assert_eq!(body["conversationId"], conversation.id);
    }

    #[tokio::test]
    async fn clear_requires_configured_password() {
        let hash = bcrypt::hash("limpar", 4).unwrap();
        let api = api(&[("ADMIN_CLEAR_PASSWORD_HASH", hash.as_str())]);
        call(
            &api.router,
            webhook_request(&customer_payload("m1", "5511988887777", "Olá")),
        )
        .await;

        let (status, _) = call(
            &api.router,
            json_request("POST", "/leads/clear", json!({ "password": "errada" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(
            &api.router,
            json_request("POST", "/leads/clear", json!({ "password": "limpar" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], 1);
        assert!(api.store.find_lead_by_phone("5511988887777").await.unwrap().is_none());
    }

    #[test]
    fn signature_check_rejects_tampering() {
        let mut mac = Hmac::<Sha256>::new_from_slice(b"k").unwrap();
        mac.update(b"body");
        let signature = hex::encode(mac.finalize().into_bytes());
        assert!(verify_signature("k", &format!("sha256={signature}"), b"body"));
        assert!(!verify_signature("k", &format!("sha256={signature}"), b"b0dy"));
        assert!(!verify_signature("k", "sha256=zz", b"body"));
    }
}
