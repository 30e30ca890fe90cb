use relay_plugin::PluginError;

/// Read a required tuning variable; a missing value is a loud failure
/// naming the variable.
pub fn required_u64(name: &str) -> Result<u64, PluginError> {
    let raw = std::env::var(name)
        .map_err(|_| PluginError(format!("environment variable {name} is required but not set")))?;
    raw.parse::<u64>()
        .map_err(|_| PluginError(format!("environment variable {name} is not a valid integer: '{raw}'")))
}

pub fn optional_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.parse::<u64>().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, "ignoring non-integer environment override");
            default
        }),
        Err(_) => default,
    }
}

/// Default output budget for Anthropic upstreams when the client sent no
/// max_tokens. Overridable via `ANTHROPIC_MAX_TOKENS`.
pub fn anthropic_max_tokens() -> u64 {
    optional_u64("ANTHROPIC_MAX_TOKENS", 8192)
}

/// Thinking-budget for a given OpenAI reasoning effort when targeting an
/// Anthropic upstream. The matching variable is required the moment a
/// request carries that effort.
pub fn openai_effort_to_anthropic_tokens(effort: &str) -> Result<u64, PluginError> {
    required_u64(&format!(
        "OPENAI_{}_TO_ANTHROPIC_TOKENS",
        effort.to_uppercase()
    ))
}

/// Same mapping for Gemini upstreams (`thinkingBudget`).
pub fn openai_effort_to_gemini_tokens(effort: &str) -> Result<u64, PluginError> {
    required_u64(&format!(
        "OPENAI_{}_TO_GEMINI_TOKENS",
        effort.to_uppercase()
    ))
}

/// Map an Anthropic thinking budget onto an OpenAI reasoning effort.
/// Thresholds are overridable; the defaults split at 4k/16k tokens.
pub fn anthropic_budget_to_openai_effort(budget_tokens: u64) -> &'static str {
    let low = optional_u64("ANTHROPIC_TO_OPENAI_LOW_REASONING_THRESHOLD", 4096);
    let high = optional_u64("ANTHROPIC_TO_OPENAI_HIGH_REASONING_THRESHOLD", 16_384);
    if budget_tokens <= low {
        "low"
    } else if budget_tokens <= high {
        "medium"
    } else {
        "high"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_variable_failure_names_it() {
        unsafe { std::env::remove_var("OPENAI_LOW_TO_ANTHROPIC_TOKENS") };
        let err = openai_effort_to_anthropic_tokens("low").unwrap_err();
        assert!(err.0.contains("OPENAI_LOW_TO_ANTHROPIC_TOKENS"), "{}", err.0);
    }

    #[test]
    fn effort_thresholds() {
        unsafe {
            std::env::remove_var("ANTHROPIC_TO_OPENAI_LOW_REASONING_THRESHOLD");
            std::env::remove_var("ANTHROPIC_TO_OPENAI_HIGH_REASONING_THRESHOLD");
        }
        assert_eq!(anthropic_budget_to_openai_effort(1024), "low");
        assert_eq!(anthropic_budget_to_openai_effort(8192), "medium");
        assert_eq!(anthropic_budget_to_openai_effort(32_768), "high");
    }
}
