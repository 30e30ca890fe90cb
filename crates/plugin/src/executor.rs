use crate::context::{PluginContext, PluginHttpResponse};
use crate::registry::PluginInstance;

/// The per-request plugin chain: global plugins first, then route
/// plugins. Inbound hooks walk the same chain in reverse (onion model).
pub struct PluginChain {
    plugins: Vec<PluginInstance>,
}

impl PluginChain {
    pub fn new(global: Vec<PluginInstance>, route: Vec<PluginInstance>) -> Self {
        let mut plugins = global;
        plugins.extend(route);
        Self { plugins }
    }

    pub fn plugins(&self) -> &[PluginInstance] {
        &self.plugins
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    fn inbound(&self) -> impl Iterator<Item = &PluginInstance> {
        self.plugins.iter().rev()
    }

    pub async fn run_request_init(&self, ctx: &mut PluginContext) {
        for instance in &self.plugins {
            if let Err(e) = instance.plugin.on_request_init(ctx).await {
                tracing::warn!(plugin = %instance.name, error = %e, "on_request_init failed");
            }
        }
    }

    pub async fn run_before_request(&self, ctx: &mut PluginContext) {
        for instance in &self.plugins {
            if let Err(e) = instance.plugin.on_before_request(ctx).await {
                tracing::warn!(plugin = %instance.name, error = %e, "on_before_request failed");
            }
        }
    }

    /// First plugin returning a response wins and stops iteration.
    pub async fn run_intercept(&self, ctx: &mut PluginContext) -> Option<PluginHttpResponse> {
        for instance in &self.plugins {
            match instance.plugin.on_intercept_request(ctx).await {
                Ok(Some(response)) => {
                    tracing::debug!(plugin = %instance.name, "request intercepted");
                    return Some(response);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(plugin = %instance.name, error = %e, "on_intercept_request failed");
                }
            }
        }
        None
    }

    /// Inbound order. A returned replacement becomes the response seen
    /// by the remaining (outer) plugins and ultimately the client.
    pub async fn run_on_response(&self, ctx: &mut PluginContext) {
        for instance in self.inbound() {
            match instance.plugin.on_response(ctx).await {
                Ok(Some(replacement)) => {
                    ctx.response = Some(replacement);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(plugin = %instance.name, error = %e, "on_response failed");
                }
            }
        }
    }

    /// Inbound order, observation only; the caller re-surfaces the
    /// original error afterwards.
    pub async fn run_on_error(&self, ctx: &mut PluginContext) {
        for instance in self.inbound() {
            if let Err(e) = instance.plugin.on_error(ctx).await {
                tracing::warn!(plugin = %instance.name, error = %e, "on_error hook failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Plugin, PluginError};
    use crate::url::PluginUrl;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn ctx() -> PluginContext {
        PluginContext::new(
            "req-1",
            "POST",
            PluginUrl::from_url(&url::Url::parse("http://u/v1/x").unwrap()),
            Vec::new(),
            Some(json!({})),
        )
    }

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
        intercept: bool,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_before_request(&self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
            self.log.lock().unwrap().push(format!("out:{}", self.name));
            if self.fail {
                return Err(PluginError("synthetic".into()));
            }
            Ok(())
        }

        async fn on_intercept_request(
            &self,
            _ctx: &mut PluginContext,
        ) -> Result<Option<crate::context::PluginHttpResponse>, PluginError> {
            if self.intercept {
                return Ok(Some(crate::context::PluginHttpResponse::json(
                    200,
                    &json!({"intercepted": self.name}),
                )));
            }
            Ok(None)
        }

        async fn on_response(
            &self,
            _ctx: &mut PluginContext,
        ) -> Result<Option<crate::context::PluginHttpResponse>, PluginError> {
            self.log.lock().unwrap().push(format!("in:{}", self.name));
            Ok(None)
        }
    }

    fn recorder(
        name: &str,
        log: &Arc<Mutex<Vec<String>>>,
        fail: bool,
        intercept: bool,
    ) -> PluginInstance {
        PluginInstance {
            name: name.to_string(),
            plugin: Arc::new(Recorder {
                name: name.to_string(),
                log: Arc::clone(log),
                fail,
                intercept,
            }),
        }
    }

    #[tokio::test]
    async fn outbound_global_then_route_inbound_reversed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = PluginChain::new(
            vec![recorder("g1", &log, false, false), recorder("g2", &log, false, false)],
            vec![recorder("r1", &log, false, false)],
        );

        let mut ctx = ctx();
        chain.run_before_request(&mut ctx).await;
        chain.run_on_response(&mut ctx).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["out:g1", "out:g2", "out:r1", "in:r1", "in:g2", "in:g1"]
        );
    }

    #[tokio::test]
    async fn hook_error_does_not_abort_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = PluginChain::new(
            vec![recorder("bad", &log, true, false), recorder("after", &log, false, false)],
            Vec::new(),
        );
        let mut ctx = ctx();
        chain.run_before_request(&mut ctx).await;
        assert_eq!(*log.lock().unwrap(), vec!["out:bad", "out:after"]);
    }

    #[tokio::test]
    async fn intercept_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = PluginChain::new(
            vec![
                recorder("first", &log, false, true),
                recorder("never", &log, false, true),
            ],
            Vec::new(),
        );
        let mut ctx = ctx();
        let response = chain.run_intercept(&mut ctx).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["intercepted"], "first");
    }
}
