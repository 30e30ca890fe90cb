use crate::logger::{AttemptRecord, RequestLogger};
use crate::proxy;
use crate::{AppState, auth};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_core::config::{AppConfig, RouteConfig};
use relay_core::error::GatewayError;
use relay_core::snapshot::{MAX_SNAPSHOT_BYTES, RequestSnapshot};
use relay_core::upstream::{Eligibility, RuntimeUpstream, select_upstream};
use relay_plugin::{PluginChain, PluginInstance};
use relay_store::RequestType;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

/// Browser noise answered before any routing or logging.
fn is_reserved_probe(path: &str) -> bool {
    matches!(path, "/favicon.ico" | "/robots.txt") || path.starts_with("/.well-known/")
}

/// Top-level proxy entry: everything that is not a management route
/// lands here.
pub async fn proxy_entry(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    if is_reserved_probe(&path) {
        return StatusCode::NO_CONTENT.into_response();
    }

    let config = state.config.load_full();
    let Some(route) = config.match_route(&path) else {
        return GatewayError::RouteNotFound.into_response();
    };

    let method = request.method().as_str().to_string();
    let query = request.uri().query().map(String::from);
    let absolute_url = match absolute_request_url(&request, &config) {
        Ok(url) => url,
        Err(e) => return e.into_response(),
    };
    let headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();

    let body = match axum::body::to_bytes(request.into_body(), MAX_SNAPSHOT_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return GatewayError::PayloadTooLarge { limit: MAX_SNAPSHOT_BYTES }.into_response();
        }
    };

    let snapshot = match RequestSnapshot::capture(
        &method,
        absolute_url,
        headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        body.clone(),
    ) {
        Ok(snapshot) => snapshot,
        Err(e) => return e.into_response(),
    };

    let mut logger = RequestLogger::new(
        state.writer.clone(),
        Arc::clone(&state.mirror),
        Arc::clone(&state.body_store),
        Arc::clone(&state.header_store),
        &method,
        &path,
        query,
    );
    logger.set_route(&route.path);
    logger.step("route");
    logger.capture_original(
        snapshot.headers(),
        if body.is_empty() { None } else { Some(body) },
    );

    // route-level plugin instances live for the whole request
    let acquired_global = state.registry.acquire_instances(&config.plugins).await;
    let acquired_route = state.registry.acquire_instances(&route.plugins).await;
    let global_instances = acquired_global.instances();
    let route_instances = acquired_route.instances();

    let (auth_info, auth_result) = auth::check(config.effective_auth(route), &snapshot);
    logger.set_auth(auth_info);

    let response = match auth_result {
        Ok(()) => {
            logger.step("auth");
            run_failover_loop(
                &state,
                route,
                &snapshot,
                &mut logger,
                &global_instances,
                &route_instances,
            )
            .await
        }
        Err(e) => e.into_response(),
    };

    // release on every exit path
    acquired_route.release().await;
    acquired_global.release().await;

    response
}

fn absolute_request_url(request: &Request, config: &AppConfig) -> Result<Url, GatewayError> {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| format!("{}:{}", config.host, config.port));
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Url::parse(&format!("http://{host}{path_and_query}"))
        .map_err(|e| GatewayError::Internal(format!("invalid request URL: {e}")))
}

/// The failover attempt loop: selector over the remaining candidates,
/// breaker eligibility, dispatch, transition, repeat.
async fn run_failover_loop(
    state: &AppState,
    route: &RouteConfig,
    snapshot: &RequestSnapshot,
    logger: &mut RequestLogger,
    global_instances: &[PluginInstance],
    route_instances: &[PluginInstance],
) -> Response {
    let runtime = state.runtime.load_full();
    let upstreams: Vec<Arc<RuntimeUpstream>> = runtime.upstreams_for(&route.path).to_vec();
    if upstreams.is_empty() {
        return GatewayError::AllUpstreamsFailed.into_response();
    }

    let policy = route.failover_policy();
    let total = upstreams.len();
    let mut attempted: HashSet<usize> = HashSet::new();
    let mut skipped: HashSet<usize> = HashSet::new();
    let mut attempt_number = 0u32;
    let mut last_transient: Option<(u16, String)> = None;

    while attempted.len() + skipped.len() < total {
        let remaining: Vec<(usize, Arc<RuntimeUpstream>)> = upstreams
            .iter()
            .enumerate()
            .filter(|(i, _)| !attempted.contains(i) && !skipped.contains(i))
            .map(|(i, u)| (i, Arc::clone(u)))
            .collect();
        let candidates: Vec<Arc<RuntimeUpstream>> =
            remaining.iter().map(|(_, u)| Arc::clone(u)).collect();

        let Some(selected) = select_upstream(&candidates, &policy, Instant::now()) else {
            break;
        };
        let index = remaining
            .iter()
            .find(|(_, u)| Arc::ptr_eq(u, &selected))
            .map(|(i, _)| *i)
            .unwrap_or(usize::MAX);

        let probe = match selected.evaluate_eligibility(&policy, Instant::now()) {
            Eligibility::Skip => {
                skipped.insert(index);
                continue;
            }
            Eligibility::Probe => true,
            Eligibility::Admit => false,
        };

        attempted.insert(index);
        attempt_number += 1;
        let last_hop = attempted.len() + skipped.len() == total;
        let timeout = selected.attempt_timeout(&policy);

        // upstream-scoped plugins join the chain for this attempt only
        let acquired_upstream = state.registry.acquire_instances(selected.plugins()).await;
        let mut inner = route_instances.to_vec();
        inner.extend(acquired_upstream.instances());
        let chain = PluginChain::new(global_instances.to_vec(), inner);

        let outcome = proxy::proxy_request(
            state,
            snapshot,
            route,
            &selected,
            &chain,
            logger.parent_id(),
            timeout,
            last_hop,
        )
        .await;
        acquired_upstream.release().await;

        let target = selected.target().to_string();
        match outcome {
            Ok(success) => {
                if success.status < 400 {
                    selected.record_success(&policy, Instant::now());
                } else if policy.retryable_status_codes.contains(&success.status) {
                    // final-hop retryable response still trips the breaker
                    selected.record_failure(&policy, Instant::now());
                }
                logger.step("proxy");
                logger.log_attempt(AttemptRecord {
                    attempt_number,
                    upstream: Some(target),
                    status: success.status,
                    request_type: if probe { RequestType::Recovery } else { RequestType::Final },
                    error_message: None,
                    transformer: success.artifacts.transformer,
                    transformed_path: success.artifacts.transformed_path,
                    request_body: success.artifacts.request_body,
                    request_headers: Some(success.artifacts.request_headers),
                    response_body: success.artifacts.response_body,
                    response_headers: Some(success.artifacts.response_headers),
                });
                return success.response;
            }
            Err(e) if e.counts_as_upstream_failure() => {
                selected.record_failure(&policy, Instant::now());
                let status = match &e {
                    GatewayError::UpstreamTransient { status, .. } => *status,
                    other => other.status_code().as_u16(),
                };
                logger.log_attempt(AttemptRecord {
                    attempt_number,
                    upstream: Some(target),
                    status,
                    request_type: if probe { RequestType::Recovery } else { RequestType::Retry },
                    error_message: Some(e.to_string()),
                    ..Default::default()
                });
                if let GatewayError::UpstreamTransient { status, body } = e {
                    last_transient = Some((status, body));
                }
            }
            Err(e) => {
                // local failure (plugin load, serialization, …): no
                // breaker transition, surfaced directly
                logger.log_attempt(AttemptRecord {
                    attempt_number,
                    upstream: Some(target),
                    status: e.status_code().as_u16(),
                    request_type: if probe { RequestType::Recovery } else { RequestType::Final },
                    error_message: Some(e.to_string()),
                    ..Default::default()
                });
                return e.into_response();
            }
        }
    }

    if attempt_number == 0 {
        // zero attempts logged, by contract
        return GatewayError::AllUpstreamsIneligible.into_response();
    }
    if let Some((status, body)) = last_transient {
        return GatewayError::UpstreamTransient { status, body }.into_response();
    }
    GatewayError::AllUpstreamsFailed.into_response()
}
