use relay_core::config::AuthConfig;
use relay_core::error::GatewayError;
use relay_core::snapshot::RequestSnapshot;
use relay_store::AuthInfo;

/// Check the effective auth policy against the captured request.
/// Returns the outcome for logging plus the gate result.
pub fn check(policy: Option<&AuthConfig>, snapshot: &RequestSnapshot) -> (AuthInfo, Result<(), GatewayError>) {
    let Some(policy) = policy.filter(|p| p.enabled) else {
        return (
            AuthInfo { success: true, level: "none".to_string() },
            Ok(()),
        );
    };

    let presented = snapshot
        .header("authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(token) if policy.tokens.iter().any(|t| t == token) => (
            AuthInfo { success: true, level: "bearer".to_string() },
            Ok(()),
        ),
        Some(_) => (
            AuthInfo { success: false, level: "bearer".to_string() },
            Err(GatewayError::Unauthorized("invalid token".to_string())),
        ),
        None => (
            AuthInfo { success: false, level: "bearer".to_string() },
            Err(GatewayError::Unauthorized("missing bearer token".to_string())),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use url::Url;

    fn snapshot(auth_header: Option<&str>) -> RequestSnapshot {
        let headers: Vec<(&str, &str)> = auth_header
            .map(|v| vec![("Authorization", v)])
            .unwrap_or_default();
        RequestSnapshot::capture("GET", Url::parse("http://gw/x").unwrap(), headers, Bytes::new())
            .unwrap()
    }

    fn policy(tokens: &[&str]) -> AuthConfig {
        AuthConfig {
            enabled: true,
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn disabled_policy_passes() {
        let (info, result) = check(None, &snapshot(None));
        assert!(result.is_ok());
        assert_eq!(info.level, "none");
    }

    #[test]
    fn valid_token_passes() {
        let (info, result) = check(Some(&policy(&["tok"])), &snapshot(Some("Bearer tok")));
        assert!(result.is_ok());
        assert!(info.success);
        assert_eq!(info.level, "bearer");
    }

    #[test]
    fn wrong_or_missing_token_fails() {
        let (_, result) = check(Some(&policy(&["tok"])), &snapshot(Some("Bearer nope")));
        assert!(matches!(result, Err(GatewayError::Unauthorized(_))));

        let (info, result) = check(Some(&policy(&["tok"])), &snapshot(None));
        assert!(result.is_err());
        assert!(!info.success);
    }
}
