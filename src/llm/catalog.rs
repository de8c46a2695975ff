//! Static model catalog per backend.
//!
//! Entries are `"<model id> | <display name>"`; callers split on the
//! pipe when they need the parts separately.

/// Known models for a backend, or `None` for backends whose listings
/// are only discoverable at runtime (e.g. self-hosted Ollama).
pub fn models_for(backend: &str) -> Option<&'static [&'static str]> {
    match backend {
        "openai" => Some(&[
            "gpt-4.1 | GPT-4.1",
            "gpt-4o | GPT-4o",
            "gpt-4o-mini | GPT-4o Mini",
            "gpt-4-turbo | GPT-4 Turbo",
            "gpt-4 | GPT-4",
            "o3 (thinking) | GPT-o3",
            "o3-mini | GPT-o3 Mini",
            "o1 | GPT-o1",
            "o1-mini | GPT-o1 Mini",
            "gpt-3.5-turbo | GPT-3.5 Turbo",
            "gpt-3.5-turbo-16k | GPT-3.5 Turbo 16K",
        ]),
        "claude" => Some(&[
            "claude-opus-4-0 (thinking) | Claude Opus 4",
            "claude-sonnet-4-0 (thinking) | Claude Sonnet 4",
            "claude-3-7-sonnet-latest (thinking) | Claude Sonnet 3.7",
            "claude-3-5-sonnet-latest | Claude Sonnet 3.5",
            "claude-3-5-haiku-latest | Claude Haiku 3.5",
            "claude-3-opus-latest | Claude Opus 3",
        ]),
        "deepseek" => Some(&[
            "deepseek-chat | DeepSeek V3",
            "deepseek-reasoner | DeepSeek R1",
        ]),
        "gemini" => Some(&[
            "gemini-2.5-pro-preview-05-06 (thinking) | Gemini 2.5 Pro Preview",
            "gemini-2.0-flash | Gemini 2.0 Flash",
            "gemini-2.0-flash-lite | Gemini 2.0 Flash-Lite",
            "gemini-1.5-pro | Gemini 1.5 Pro",
            "gemini-1.5-flash | Gemini 1.5 Flash",
        ]),
        "grok" => Some(&[
            "grok-3-latest | Grok 3",
            "grok-3-fast-latest | Grok 3 Fast",
            "grok-3-mini-latest | Grok 3 Mini",
            "grok-2-latest | Grok 2",
        ]),
        "zhipu" => Some(&[
            "glm-4-plus | GLM-4 Plus",
            "glm-4 | GLM-4",
            "glm-4-air | GLM-4 Air",
            "glm-4-long | GLM-4 Long",
            "glm-4-flash | GLM-4 Flash",
        ]),
        "qianwen" => Some(&[
            "qwen-max | QWEN Max",
            "qwen-plus | QWEN Plus",
            "qwen-turbo | QWEN Turbo",
            "qwen-long | QWEN Long",
        ]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_well_formed() {
        for backend in ["openai", "claude", "deepseek", "gemini", "grok", "zhipu", "qianwen"] {
            let models = models_for(backend).unwrap();
            assert!(!models.is_empty());
            for entry in models {
                assert!(entry.contains(" | "), "malformed entry: {entry}");
            }
        }
    }

    #[test]
    fn ollama_has_no_static_listing() {
        assert!(models_for("ollama").is_none());
    }
}
