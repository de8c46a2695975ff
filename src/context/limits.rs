//! Per-model context budgets.

/// Resolve the context budget (in heuristic units) for a model.
///
/// Lookup order: explicit caller override, exact (backend, model)
/// entry, per-backend default, global default.
pub fn context_limit(backend: &str, model: &str, explicit: Option<usize>) -> usize {
    if let Some(limit) = explicit.filter(|l| *l > 0) {
        return limit;
    }
    model_limit(backend, model).unwrap_or_else(|| backend_default(backend))
}

const GLOBAL_DEFAULT: usize = 3_000;

fn model_limit(backend: &str, model: &str) -> Option<usize> {
    let limit = match (backend, model) {
        ("openai", "gpt-4-turbo") => 32_000,
        ("openai", "gpt-4.1") => 32_000,
        ("openai", "gpt-4" | "gpt-4o" | "gpt-4o-mini") => 6_000,
        ("openai", "gpt-3.5-turbo-16k") => 16_000,
        ("zhipu", "glm-4-long") => 128_000,
        ("qianwen", "qwen-long") => 32_000,
        ("claude", "claude-2.1" | "claude-2.0") => 100_000,
        _ => return None,
    };
    Some(limit)
}

fn backend_default(backend: &str) -> usize {
    match backend {
        "openai" => 3_000,
        "claude" => 200_000,
        "deepseek" => 32_000,
        "gemini" => 100_000,
        "grok" => 32_000,
        "zhipu" => 32_000,
        "qianwen" => 8_000,
        _ => GLOBAL_DEFAULT,
    }
}
