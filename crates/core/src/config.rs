use crate::context::ExpressionContext;
use crate::expr::Evaluated;
use crate::rules::ModificationRules;
use crate::template::process_dynamic_value;
use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Digest;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ─── Config ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,

    /// Inbound request body limit in bytes.
    pub body_parser_limit: Option<usize>,

    pub auth: Option<AuthConfig>,
    pub logging: LoggingConfig,

    /// Global plugins, applied to every route before route plugins.
    pub plugins: Vec<PluginRef>,

    pub routes: Vec<RouteConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            body_parser_limit: None,
            auth: None,
            logging: LoggingConfig::default(),
            plugins: Vec::new(),
            routes: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load config from a JSON file, expand env templates, and validate.
    pub fn load(path: &str) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: AppConfig = serde_json::from_str(&contents)?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    /// First prefix match in declaration order.
    pub fn match_route(&self, path: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|r| path.starts_with(&r.path))
    }

    /// Effective auth policy for a route: route override beats global.
    pub fn effective_auth<'a>(&'a self, route: &'a RouteConfig) -> Option<&'a AuthConfig> {
        route.auth.as_ref().or(self.auth.as_ref())
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        anyhow::ensure!(!self.routes.is_empty(), "config has no routes");
        for route in &self.routes {
            anyhow::ensure!(
                route.path.starts_with('/'),
                "route path '{}' must start with '/'",
                route.path
            );
            anyhow::ensure!(
                !route.upstreams.is_empty(),
                "route '{}' has no upstreams",
                route.path
            );
            for upstream in &route.upstreams {
                let url = url::Url::parse(&upstream.target).map_err(|e| {
                    anyhow::anyhow!("route '{}': invalid target '{}': {e}", route.path, upstream.target)
                })?;
                anyhow::ensure!(
                    matches!(url.scheme(), "http" | "https"),
                    "route '{}': target '{}' must be http(s)",
                    route.path,
                    upstream.target
                );
                anyhow::ensure!(
                    upstream.weight > 0,
                    "route '{}': upstream weight must be positive",
                    route.path
                );
                anyhow::ensure!(
                    upstream.priority > 0,
                    "route '{}': upstream priority must be positive",
                    route.path
                );
            }
            if let Some(rewrites) = &route.path_rewrite {
                for pattern in rewrites.keys() {
                    regex::Regex::new(pattern).map_err(|e| {
                        anyhow::anyhow!("route '{}': invalid pathRewrite regex '{pattern}': {e}", route.path)
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Expand `{{env.X}}` templates in auth tokens at load time.
    fn sanitize(&mut self) {
        let ctx = ExpressionContext::default();
        if let Some(auth) = &mut self.auth {
            expand_tokens(&mut auth.tokens, &ctx);
        }
        for route in &mut self.routes {
            if let Some(auth) = &mut route.auth {
                expand_tokens(&mut auth.tokens, &ctx);
            }
        }
    }
}

fn expand_tokens(tokens: &mut [String], ctx: &ExpressionContext) {
    for token in tokens.iter_mut() {
        if let Evaluated::Value(Value::String(expanded)) =
            process_dynamic_value(&Value::String(token.clone()), ctx)
        {
            *token = expanded;
        }
    }
}

// ─── Sub-configs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub body: BodyLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BodyLogConfig {
    pub enabled: bool,
    /// Bodies above this size are not persisted unless the response errored.
    pub max_size: usize,
}

impl Default for BodyLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 5 * 1024,
        }
    }
}

/// A plugin reference: either a bare name or a detailed record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PluginRef {
    Name(String),
    Detailed {
        path: String,
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default)]
        options: Map<String, Value>,
    },
}

impl PluginRef {
    pub fn name(&self) -> &str {
        match self {
            PluginRef::Name(name) => name,
            PluginRef::Detailed { path, .. } => path,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            PluginRef::Name(_) => true,
            PluginRef::Detailed { enabled, .. } => *enabled,
        }
    }

    pub fn options(&self) -> Map<String, Value> {
        match self {
            PluginRef::Name(_) => Map::new(),
            PluginRef::Detailed { options, .. } => options.clone(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteConfig {
    pub path: String,
    /// Ordered regex → replacement pairs; first match wins.
    pub path_rewrite: Option<Map<String, Value>>,
    pub auth: Option<AuthConfig>,
    pub plugins: Vec<PluginRef>,
    pub failover: Option<FailoverPolicy>,
    pub headers: Option<ModificationRules>,
    pub body: Option<ModificationRules>,
    pub query: Option<ModificationRules>,
    pub response_headers: Option<ModificationRules>,
    pub response_body: Option<ModificationRules>,
    pub upstreams: Vec<UpstreamConfig>,
}

impl RouteConfig {
    pub fn failover_policy(&self) -> FailoverPolicy {
        self.failover.clone().unwrap_or_default()
    }

    /// Apply the first matching rewrite rule to a path.
    pub fn rewrite_path(&self, path: &str) -> String {
        let Some(rewrites) = &self.path_rewrite else {
            return path.to_string();
        };
        for (pattern, replacement) in rewrites {
            let Some(replacement) = replacement.as_str() else {
                continue;
            };
            // patterns were validated at load
            if let Ok(re) = regex::Regex::new(pattern)
                && re.is_match(path)
            {
                return re.replace(path, replacement).into_owned();
            }
        }
        path.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamConfig {
    pub target: String,
    pub weight: u32,
    pub priority: u32,
    pub plugins: Vec<PluginRef>,
    pub headers: Option<ModificationRules>,
    pub body: Option<ModificationRules>,
    pub query: Option<ModificationRules>,
    pub response_headers: Option<ModificationRules>,
    pub response_body: Option<ModificationRules>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            weight: 100,
            priority: 1,
            plugins: Vec::new(),
            headers: None,
            body: None,
            query: None,
            response_headers: None,
            response_body: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FailoverPolicy {
    pub retryable_status_codes: Vec<u16>,
    pub consecutive_failures_threshold: u32,
    pub healthy_threshold: u32,
    pub recovery_interval_ms: u64,
    pub recovery_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub slow_start: Option<SlowStartConfig>,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            retryable_status_codes: Vec::new(),
            consecutive_failures_threshold: 3,
            healthy_threshold: 2,
            recovery_interval_ms: 5000,
            recovery_timeout_ms: 3000,
            request_timeout_ms: 30_000,
            slow_start: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SlowStartConfig {
    pub warmup_ms: u64,
}

impl Default for SlowStartConfig {
    fn default() -> Self {
        Self { warmup_ms: 10_000 }
    }
}

// ─── Config Watcher ────────────────────────────────────────────────────────

pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching a config file. On changes (debounced 300 ms,
    /// SHA-256 content dedup), reload and atomically swap the config in.
    pub fn start(
        path: String,
        config: Arc<ArcSwap<AppConfig>>,
        on_reload: impl Fn(&AppConfig) + Send + Sync + 'static,
    ) -> Result<Self, anyhow::Error> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(16);

        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
            if let Ok(event) = res
                && (event.kind.is_modify() || event.kind.is_create())
            {
                let _ = tx.blocking_send(());
            }
        })?;
        watcher.watch(Path::new(&path), RecursiveMode::NonRecursive)?;

        let path_clone = path.clone();
        tokio::spawn(async move {
            let mut last_hash: Option<[u8; 32]> = None;
            let mut debounce: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    Some(()) = rx.recv() => {
                        debounce = Some(tokio::time::Instant::now() + Duration::from_millis(300));
                    }
                    _ = async {
                        match debounce {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        debounce = None;
                        match std::fs::read(&path_clone) {
                            Ok(contents) => {
                                let hash: [u8; 32] = sha2::Sha256::digest(&contents).into();
                                if last_hash.as_ref() == Some(&hash) {
                                    continue;
                                }
                                last_hash = Some(hash);

                                match AppConfig::load(&path_clone) {
                                    Ok(new_cfg) => {
                                        tracing::info!("Configuration reloaded successfully");
                                        on_reload(&new_cfg);
                                        config.store(Arc::new(new_cfg));
                                    }
                                    Err(e) => {
                                        tracing::error!("Config reload failed: {e}");
                                    }
                                }
                            }
                            Err(e) => tracing::error!("Config file read failed: {e}"),
                        }
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}
