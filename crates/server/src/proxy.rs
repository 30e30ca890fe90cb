use crate::AppState;
use crate::streaming;
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use relay_core::config::RouteConfig;
use relay_core::context::{ExpressionContext, UrlParts};
use relay_core::error::GatewayError;
use relay_core::rules::{self, ModificationRules};
use relay_core::snapshot::RequestSnapshot;
use relay_core::upstream::RuntimeUpstream;
use relay_plugin::{PluginChain, PluginContext, PluginHttpResponse, PluginUrl};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Hop-by-hop and recomputed headers never forwarded upstream.
const STRIPPED_REQUEST_HEADERS: [&str; 5] = [
    "host",
    "content-length",
    "connection",
    "accept-encoding",
    "transfer-encoding",
];

const STRIPPED_RESPONSE_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// What one attempt produced, for the log record.
#[derive(Debug, Default)]
pub struct AttemptArtifacts {
    pub transformer: Option<String>,
    pub transformed_path: Option<String>,
    pub request_body: Option<Bytes>,
    pub request_headers: Vec<(String, String)>,
    pub response_body: Option<Bytes>,
    pub response_headers: Vec<(String, String)>,
}

pub struct AttemptSuccess {
    pub status: u16,
    pub response: Response,
    pub artifacts: AttemptArtifacts,
}

/// Run the inbound error hooks (observation only), then re-surface the
/// original error.
async fn fail(
    chain: &PluginChain,
    pctx: &mut PluginContext,
    error: GatewayError,
) -> Result<AttemptSuccess, GatewayError> {
    pctx.error = Some(error.to_string());
    chain.run_on_error(pctx).await;
    Err(error)
}

fn merge_rules(
    base: Option<&ModificationRules>,
    overlay: Option<&ModificationRules>,
) -> Option<ModificationRules> {
    match (base, overlay) {
        (Some(b), Some(o)) => Some(rules::deep_merge_rules(b, o)),
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (None, None) => None,
    }
}

/// One dispatch to one upstream: rule layers, plugin hooks, HTTP
/// round-trip, response handling. The breaker transitions stay with the
/// caller.
#[allow(clippy::too_many_arguments)]
pub async fn proxy_request(
    state: &AppState,
    snapshot: &RequestSnapshot,
    route: &RouteConfig,
    upstream: &Arc<RuntimeUpstream>,
    chain: &PluginChain,
    request_id: &str,
    timeout: Duration,
    last_hop: bool,
) -> Result<AttemptSuccess, GatewayError> {
    let config = state.config.load_full();
    let upstream_cfg = upstream.config();

    // client-facing URL with the route rewrite applied; the upstream
    // base is prepended only immediately before dispatch
    let rewritten_path = route.rewrite_path(snapshot.pathname());
    let mut working = snapshot.url().clone();
    working.set_path(&rewritten_path);

    let ctx = ExpressionContext::new(
        snapshot.headers_value(),
        snapshot.body_json().unwrap_or(Value::Null),
        UrlParts {
            pathname: rewritten_path.clone(),
            search: snapshot.search(),
            host: snapshot.host(),
            protocol: snapshot.protocol(),
        },
        snapshot.method().to_string(),
    );

    let mut pctx = PluginContext::new(
        request_id,
        snapshot.method(),
        PluginUrl::from_url(&working),
        snapshot.headers().to_vec(),
        snapshot.body_json(),
    );

    chain.run_request_init(&mut pctx).await;
    pctx.url.apply_to(&mut working);

    // Layer 1: merged route+upstream body rules
    if let Some(body_rules) = merge_rules(route.body.as_ref(), upstream_cfg.body.as_ref())
        && let Some(body) = pctx.body.as_mut()
    {
        rules::apply_body_rules(body, &body_rules, &ctx);
    }

    // request headers from the snapshot; the client's Authorization
    // never crosses to the upstream when auth is on
    let auth_enabled = config
        .effective_auth(route)
        .map(|a| a.enabled)
        .unwrap_or(false);
    if auth_enabled {
        pctx.remove_header("authorization");
    }
    for name in STRIPPED_REQUEST_HEADERS {
        pctx.remove_header(name);
    }
    if let Some(header_rules) = merge_rules(route.headers.as_ref(), upstream_cfg.headers.as_ref()) {
        rules::apply_header_rules(&mut pctx.headers, &header_rules, &ctx);
    }

    // query rules over the ordered parameter list
    let mut params = snapshot.query_pairs();
    if let Some(query_rules) = merge_rules(route.query.as_ref(), upstream_cfg.query.as_ref()) {
        rules::apply_query_rules(&mut params, &query_rules, &ctx);
    }
    set_query(&mut working, &params);
    pctx.url = PluginUrl::from_url(&working);

    chain.run_before_request(&mut pctx).await;
    pctx.url.apply_to(&mut working);

    if let Some(intercepted) = chain.run_intercept(&mut pctx).await {
        let artifacts = AttemptArtifacts {
            transformer: transformer_name(chain),
            transformed_path: Some(working.path().to_string()),
            request_headers: pctx.headers.clone(),
            ..Default::default()
        };
        let status = intercepted.status;
        return Ok(AttemptSuccess {
            status,
            response: plugin_response_into_axum(intercepted)?,
            artifacts,
        });
    }

    let request_body = serialize_body(&pctx, snapshot);
    sync_content_length(&mut pctx, request_body.as_ref());

    // prepend the upstream base path
    let mut target = upstream.target().clone();
    let full_path = format!(
        "{}{}",
        target.path().trim_end_matches('/'),
        working.path()
    );
    target.set_path(&full_path);
    target.set_query(working.query());

    let method = reqwest::Method::from_bytes(snapshot.method().as_bytes())
        .map_err(|_| GatewayError::Internal(format!("invalid method {}", snapshot.method())))?;
    let mut request = state.http.request(method, target.clone());
    for (name, value) in &pctx.headers {
        request = request.header(name, value);
    }
    if let Some(body) = &request_body {
        request = request.body(body.clone());
    }

    // the timeout aborts in-flight I/O by dropping the request future
    let response = match tokio::time::timeout(timeout, request.send()).await {
        Err(_) => {
            let ms = timeout.as_millis() as u64;
            return fail(chain, &mut pctx, GatewayError::Timeout { ms }).await;
        }
        Ok(Err(e)) => return fail(chain, &mut pctx, e.into()).await,
        Ok(Ok(response)) => response,
    };

    let status = response.status().as_u16();
    let response_headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_lowercase(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();

    let mut artifacts = AttemptArtifacts {
        transformer: transformer_name(chain),
        transformed_path: Some(full_path.clone()),
        request_body: request_body.clone(),
        request_headers: pctx.headers.clone(),
        response_body: None,
        response_headers: response_headers.clone(),
    };

    // a retryable status hands control back to the failover loop, except
    // on the final hop, which returns the upstream response as-is
    if !last_hop
        && route
            .failover_policy()
            .retryable_status_codes
            .contains(&status)
    {
        let body = tokio::time::timeout(timeout, response.text())
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        return fail(chain, &mut pctx, GatewayError::UpstreamTransient { status, body }).await;
    }

    let is_sse = response_headers
        .iter()
        .find(|(k, _)| k == "content-type")
        .map(|(_, v)| v.contains("text/event-stream"))
        .unwrap_or(false);

    if is_sse {
        let response_body_rules = merge_rules(
            route.response_body.as_ref(),
            upstream_cfg.response_body.as_ref(),
        );
        let spliced = streaming::splice(
            response,
            chain,
            request_id,
            response_body_rules,
            ctx,
            &response_headers,
        );
        return Ok(AttemptSuccess {
            status,
            response: spliced,
            artifacts,
        });
    }

    // non-streaming: buffer, run inbound hooks, apply response rules
    let body = match tokio::time::timeout(timeout, response.bytes()).await {
        Err(_) => {
            let ms = timeout.as_millis() as u64;
            return fail(chain, &mut pctx, GatewayError::Timeout { ms }).await;
        }
        Ok(Err(e)) => return fail(chain, &mut pctx, e.into()).await,
        Ok(Ok(body)) => body,
    };

    pctx.response = Some(PluginHttpResponse {
        status,
        headers: response_headers,
        body,
    });
    chain.run_on_response(&mut pctx).await;
    let mut final_response = pctx
        .response
        .take()
        .unwrap_or_else(|| PluginHttpResponse {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        });

    apply_response_rules(route, upstream_cfg, &mut final_response, &ctx);

    artifacts.response_body = Some(final_response.body.clone());
    artifacts.response_headers = final_response.headers.clone();

    let status = final_response.status;
    Ok(AttemptSuccess {
        status,
        response: plugin_response_into_axum(final_response)?,
        artifacts,
    })
}

fn apply_response_rules(
    route: &RouteConfig,
    upstream_cfg: &relay_core::config::UpstreamConfig,
    response: &mut PluginHttpResponse,
    ctx: &ExpressionContext,
) {
    if let Some(header_rules) = merge_rules(
        route.response_headers.as_ref(),
        upstream_cfg.response_headers.as_ref(),
    ) {
        rules::apply_header_rules(&mut response.headers, &header_rules, ctx);
    }

    let Some(body_rules) = merge_rules(
        route.response_body.as_ref(),
        upstream_cfg.response_body.as_ref(),
    ) else {
        return;
    };
    let Ok(mut body) = serde_json::from_slice::<Value>(&response.body) else {
        return;
    };
    rules::apply_body_rules(&mut body, &body_rules, ctx);
    response.body = Bytes::from(body.to_string());
}

fn serialize_body(pctx: &PluginContext, snapshot: &RequestSnapshot) -> Option<Bytes> {
    if let Some(body) = &pctx.body {
        return serde_json::to_vec(body).ok().map(Bytes::from);
    }
    snapshot.body_bytes()
}

fn sync_content_length(pctx: &mut PluginContext, body: Option<&Bytes>) {
    match body {
        Some(bytes) if !bytes.is_empty() => {
            pctx.set_header("content-length", bytes.len().to_string());
        }
        _ => pctx.remove_header("content-length"),
    }
}

fn set_query(url: &mut url::Url, params: &[(String, String)]) {
    if params.is_empty() {
        url.set_query(None);
        return;
    }
    url.query_pairs_mut().clear().extend_pairs(params);
}

fn transformer_name(chain: &PluginChain) -> Option<String> {
    chain
        .plugins()
        .iter()
        .find(|p| relay_translator::catalog(&p.name).is_some())
        .map(|p| p.name.clone())
}

fn plugin_response_into_axum(resp: PluginHttpResponse) -> Result<Response, GatewayError> {
    let mut builder = axum::http::Response::builder().status(resp.status);
    let mut has_content_type = false;
    for (name, value) in &resp.headers {
        if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if name == "content-type" {
            has_content_type = true;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !has_content_type {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }
    builder
        .body(axum::body::Body::from(resp.body))
        .map_err(|e| GatewayError::Internal(format!("failed to build response: {e}")))
}
