// Advertised model catalog and routing to upstream model names.

use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Claude,
    Gemini,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Name advertised on the public surface.
    pub public_name: &'static str,
    /// Name the upstream expects.
    pub upstream_name: &'static str,
    pub display_name: &'static str,
    pub family: ModelFamily,
    /// Member of the thinking set: requests default to extended reasoning.
    pub thinking: bool,
}

pub static MODEL_CATALOG: Lazy<Vec<ModelSpec>> = Lazy::new(|| {
    vec![
        ModelSpec {
            public_name: "gemini-2.5-pro",
            upstream_name: "gemini-2.5-pro",
            display_name: "Gemini 2.5 Pro",
            family: ModelFamily::Gemini,
            thinking: false,
        },
        ModelSpec {
            public_name: "gemini-2.5-flash",
            upstream_name: "gemini-2.5-flash",
            display_name: "Gemini 2.5 Flash",
            family: ModelFamily::Gemini,
            thinking: false,
        },
        ModelSpec {
            public_name: "gemini-3-pro-preview",
            upstream_name: "gemini-3-pro-preview",
            display_name: "Gemini 3 Pro Preview",
            family: ModelFamily::Gemini,
            thinking: true,
        },
        ModelSpec {
            public_name: "claude-sonnet-4-5",
            upstream_name: "claude-sonnet-4-5",
            display_name: "Claude Sonnet 4.5",
            family: ModelFamily::Claude,
            thinking: false,
        },
        ModelSpec {
            public_name: "claude-sonnet-4-5-thinking",
            upstream_name: "claude-sonnet-4-5-thinking",
            display_name: "Claude Sonnet 4.5 (Thinking)",
            family: ModelFamily::Claude,
            thinking: true,
        },
        ModelSpec {
            public_name: "claude-opus-4-5",
            upstream_name: "claude-opus-4-5",
            display_name: "Claude Opus 4.5",
            family: ModelFamily::Claude,
            thinking: false,
        },
        ModelSpec {
            public_name: "claude-opus-4-5-thinking",
            upstream_name: "claude-opus-4-5-thinking",
            display_name: "Claude Opus 4.5 (Thinking)",
            family: ModelFamily::Claude,
            thinking: true,
        },
    ]
});

pub fn lookup(model: &str) -> Option<&'static ModelSpec> {
    MODEL_CATALOG.iter().find(|m| m.public_name == model)
}

/// Route a public model name to its upstream name. Unknown names pass
/// through unchanged so new upstream models work without a catalog bump.
pub fn map_to_upstream(model: &str) -> String {
    lookup(model)
        .map(|m| m.upstream_name.to_string())
        .unwrap_or_else(|| model.to_string())
}

pub fn is_claude_family(model: &str) -> bool {
    model.starts_with("claude")
}

/// Membership in the thinking set. Unknown `-thinking` suffixed names are
/// treated as members so dated aliases keep working.
pub fn is_thinking_model(model: &str) -> bool {
    lookup(model)
        .map(|m| m.thinking)
        .unwrap_or_else(|| model.ends_with("-thinking"))
}

/// Upstream names this relay exposes; the account-level quota is the
/// minimum over these.
pub fn exposed_upstream_models() -> Vec<&'static str> {
    MODEL_CATALOG.iter().map(|m| m.upstream_name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_models_pass_through() {
        assert_eq!(map_to_upstream("gemini-9-ultra"), "gemini-9-ultra");
        assert_eq!(map_to_upstream("claude-sonnet-4-5"), "claude-sonnet-4-5");
    }

    #[test]
    fn thinking_set_membership() {
        assert!(is_thinking_model("claude-sonnet-4-5-thinking"));
        assert!(is_thinking_model("gemini-3-pro-preview"));
        assert!(!is_thinking_model("claude-sonnet-4-5"));
        // Dated alias falls back to the suffix rule.
        assert!(is_thinking_model("claude-opus-4-5-20251101-thinking"));
    }

    #[test]
    fn claude_family_detection() {
        assert!(is_claude_family("claude-opus-4-5"));
        assert!(!is_claude_family("gemini-2.5-pro"));
    }
}
