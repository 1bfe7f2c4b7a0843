//! RPC method handlers.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use strata_core::{DeleteRequest, Lineage, Payload, PutRequest, SubscriptionId};
use strata_engine::{
    BatchRequest, BatchState, ContextService, EventFilter, ResolveOptions, SearchQuery, SubscriptionScope,
};
use strata_telemetry::TelemetryGuard;

use crate::client::{ClientId, ClientRegistry};
use crate::event_bridge;
use crate::rpc::{self, RpcResponse};

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub service: Arc<ContextService>,
    pub registry: Arc<ClientRegistry>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

impl HandlerState {
    pub fn new(service: Arc<ContextService>, registry: Arc<ClientRegistry>) -> Self {
        Self {
            service,
            registry,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// Bail out of a handler with `INVALID_PARAMS` on a parameter error.
macro_rules! param {
    ($id:expr, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err(msg) => return RpcResponse::invalid_params($id, msg),
        }
    };
}

/// Dispatch an RPC method. `client` is the calling connection, needed by
/// methods that push frames back to it.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    client: Option<&ClientId>,
    method: &str,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let params = rpc::normalize_params(params);

    match method {
        "context.get" => context_get(state, &params, id),
        "context.put" => context_put(state, &params, id),
        "context.delete" => context_delete(state, &params, id),
        "context.resolve" => context_resolve(state, &params, id),
        "context.batch" => context_batch(state, &params, id).await,
        "context.subscribe" => context_subscribe(state, client, &params, id).await,
        "context.unsubscribe" => context_unsubscribe(state, client, &params, id).await,
        "context.history" => context_history(state, &params, id),
        "context.diff" => context_diff(state, &params, id),
        "context.rollback" => context_rollback(state, &params, id),
        "context.milestone" => context_milestone(state, &params, id),
        "context.prune" => context_prune(state, &params, id),
        "context.search" => context_search(state, &params, id).await,
        "context.cacheStats" => context_cache_stats(state, id),

        "logging.setLevel" => logging_set_level(state, &params, id),
        "system.ping" | "health" => health(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

// ── Context handlers ──

fn context_get(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let key = param!(id, rpc::require_key(params));
    match state.service.get(&key) {
        Ok(ctx) => RpcResponse::success(id, json!({ "version": ctx.version, "context": ctx })),
        Err(e) => RpcResponse::context_error(id, &e),
    }
}

fn context_put(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let key = param!(id, rpc::require_key(params));
    let author = param!(id, rpc::require_author(params));
    let payload: Payload = match params.get("payload") {
        Some(_) => param!(id, rpc::parse(params, Some("payload"))),
        None => Payload::new(),
    };
    let expected = rpc::optional_i64(params, "expected_version").unwrap_or(0).max(0) as u64;

    let mut req = if expected == 0 {
        PutRequest::create(key, payload, author)
    } else {
        PutRequest::update(key, payload, expected, author)
    };
    if params.get("lineage").is_some() {
        req = req.with_lineage(param!(id, rpc::parse::<Lineage>(params, Some("lineage"))));
    }
    if let Some(parent) = rpc::optional_str(params, "parent_id") {
        req = req.under(parent);
    }
    if let Some(summary) = rpc::optional_str(params, "summary") {
        req = req.with_summary(summary);
    }
    req = req.auto_create(rpc::optional_bool(params, "auto_create_ancestors").unwrap_or(false));

    match state.service.put(&req) {
        Ok(ctx) => RpcResponse::success(id, json!({ "version": ctx.version, "context": ctx })),
        Err(e) => RpcResponse::context_error(id, &e),
    }
}

fn context_delete(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let key = param!(id, rpc::require_key(params));
    let author = param!(id, rpc::require_author(params));
    let req = DeleteRequest::new(key, author).cascade(rpc::optional_bool(params, "cascade").unwrap_or(false));
    match state.service.delete(&req) {
        Ok(deleted) => {
            let keys: Vec<_> = deleted.iter().map(|c| &c.key).collect();
            RpcResponse::success(id, json!({ "deleted": keys, "count": deleted.len() }))
        }
        Err(e) => RpcResponse::context_error(id, &e),
    }
}

fn context_resolve(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let key = param!(id, rpc::require_key(params));
    let opts = ResolveOptions {
        include_inherited: rpc::optional_bool(params, "include_inherited").unwrap_or(true),
        auto_create_ancestors: rpc::optional_bool(params, "auto_create_ancestors").unwrap_or(false),
        lineage: match params.get("lineage") {
            Some(_) => param!(id, rpc::parse(params, Some("lineage"))),
            None => Lineage::default(),
        },
    };
    match state.service.resolve(&key, &opts) {
        Ok(view) => RpcResponse::success(id, json!({ "version": view.version, "view": view })),
        Err(e) => RpcResponse::context_error(id, &e),
    }
}

async fn context_batch(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let req: BatchRequest = param!(id, rpc::parse(params, None));
    match state.service.batch(req).await {
        Ok(report) => {
            let committed = report.state == BatchState::Committed;
            RpcResponse::success(id, json!({ "committed": committed, "report": report }))
        }
        Err(e) => RpcResponse::context_error(id, &e),
    }
}

async fn context_subscribe(
    state: &Arc<HandlerState>,
    client: Option<&ClientId>,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let Some(client) = client else {
        return RpcResponse::invalid_params(id, "Subscriptions require a WebSocket connection");
    };
    let scope = match SubscriptionScope::from_str(param!(id, rpc::require_str(params, "scope"))) {
        Ok(scope) => scope,
        Err(e) => return RpcResponse::context_error(id, &e),
    };
    let scope_id = rpc::optional_str(params, "scope_id").unwrap_or_default();
    let filter: EventFilter = match params.get("filter") {
        Some(_) => param!(id, rpc::parse(params, Some("filter"))),
        None => EventFilter::default(),
    };

    let subscription = match state.service.subscribe(scope, scope_id, filter) {
        Ok(s) => s,
        Err(e) => return RpcResponse::context_error(id, &e),
    };
    let sub_id = subscription.id.clone();
    if !state.registry.add_subscription(client, sub_id.clone()).await {
        state.service.unsubscribe(&sub_id);
        return RpcResponse::internal_error(id, "Client is no longer connected");
    }
    let _forwarder = event_bridge::forward_subscription(
        Arc::clone(&state.service),
        Arc::clone(&state.registry),
        client.clone(),
        subscription,
    );
    RpcResponse::success(id, json!({ "subscriptionId": sub_id, "scope": scope, "scopeId": scope_id }))
}

async fn context_unsubscribe(
    state: &Arc<HandlerState>,
    client: Option<&ClientId>,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let sub_id = SubscriptionId::from_raw(param!(id, rpc::require_str(params, "subscription_id")));
    if let Some(client) = client {
        state.registry.remove_subscription(client, &sub_id).await;
    }
    let removed = state.service.unsubscribe(&sub_id);
    RpcResponse::success(id, json!({ "removed": removed }))
}

fn context_history(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let key = param!(id, rpc::require_key(params));
    let limit = rpc::optional_i64(params, "limit").unwrap_or(100).max(0) as usize;
    let offset = rpc::optional_i64(params, "offset").unwrap_or(0).max(0) as usize;
    match state.service.history(&key, limit, offset) {
        Ok(records) => RpcResponse::success(id, json!({ "records": records, "count": records.len() })),
        Err(e) => RpcResponse::context_error(id, &e),
    }
}

fn context_diff(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let key = param!(id, rpc::require_key(params));
    let from = param!(id, rpc::require_u64(params, "from_seq"));
    let to = param!(id, rpc::require_u64(params, "to_seq"));
    match state.service.diff(&key, from, to) {
        Ok(diff) => RpcResponse::success(id, json!({ "diff": diff })),
        Err(e) => RpcResponse::context_error(id, &e),
    }
}

fn context_rollback(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let key = param!(id, rpc::require_key(params));
    let target = param!(id, rpc::require_u64(params, "target_seq"));
    let author = param!(id, rpc::require_author(params));
    let reason = rpc::optional_str(params, "reason");
    match state.service.rollback(&key, target, reason, author) {
        Ok(ctx) => RpcResponse::success(id, json!({ "version": ctx.version, "context": ctx })),
        Err(e) => RpcResponse::context_error(id, &e),
    }
}

fn context_milestone(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let key = param!(id, rpc::require_key(params));
    let sequence = param!(id, rpc::require_u64(params, "sequence"));
    match state.service.mark_milestone(&key, sequence) {
        Ok(record) => RpcResponse::success(id, json!({ "record": record })),
        Err(e) => RpcResponse::context_error(id, &e),
    }
}

fn context_prune(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let key = param!(id, rpc::require_key(params));
    let older_than = param!(
        id,
        DateTime::parse_from_rfc3339(param!(id, rpc::require_str(params, "older_than")))
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("Invalid parameter older_than: {e}"))
    );
    let keep = rpc::optional_bool(params, "keep_milestones").unwrap_or(true);
    match state.service.prune(&key, keep, older_than) {
        Ok(removed) => RpcResponse::success(id, json!({ "removed": removed })),
        Err(e) => RpcResponse::context_error(id, &e),
    }
}

async fn context_search(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let query: SearchQuery = param!(id, rpc::parse(params, None));
    match state.service.search(query).await {
        Ok(hits) => RpcResponse::success(id, json!({ "hits": hits, "count": hits.len() })),
        Err(e) => RpcResponse::context_error(id, &e),
    }
}

fn context_cache_stats(state: &Arc<HandlerState>, id: Option<Value>) -> RpcResponse {
    RpcResponse::success(id, json!(state.service.cache_stats()))
}

// ── Logging ──

fn logging_set_level(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let Some(telemetry) = &state.telemetry else {
        return RpcResponse::internal_error(id, "Telemetry is not initialized");
    };
    let module = param!(id, rpc::require_str(params, "module"));
    let level = match tracing::Level::from_str(param!(id, rpc::require_str(params, "level"))) {
        Ok(level) => level,
        Err(e) => return RpcResponse::invalid_params(id, format!("Invalid parameter level: {e}")),
    };
    telemetry.set_module_level(module, level);
    let levels: Vec<Value> = telemetry
        .module_levels()
        .into_iter()
        .map(|(module, level)| json!({ "module": module, "level": level.to_string() }))
        .collect();
    RpcResponse::success(id, json!({ "moduleLevels": levels }))
}

// ── Health ──

fn health(state: &Arc<HandlerState>, id: Option<Value>) -> RpcResponse {
    let report = state.service.health();
    RpcResponse::success(
        id,
        json!({
            "status": if report.store_ok { "healthy" } else { "degraded" },
            "clients": state.registry.count(),
            "report": report,
        }),
    )
}
