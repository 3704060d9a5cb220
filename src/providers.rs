//! Inference provider table and the context-size based selection rule.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Provider {
    pub id: &'static str,
    pub name: &'static str,
    pub max_tokens: usize,
}

pub const AUTO: Provider = Provider { id: "auto", name: "Auto", max_tokens: 100_000 };
pub const FIREWORKS: Provider = Provider { id: "fireworks-ai", name: "Fireworks AI", max_tokens: 131_000 };
pub const SAMBANOVA: Provider = Provider { id: "sambanova", name: "SambaNova", max_tokens: 8_000 };
pub const NEBIUS: Provider = Provider { id: "nebius", name: "Nebius AI Studio", max_tokens: 131_000 };
pub const NOVITA: Provider = Provider { id: "novita", name: "NovitaAI", max_tokens: 16_000 };

pub const PROVIDERS: [Provider; 5] = [AUTO, FIREWORKS, SAMBANOVA, NEBIUS, NOVITA];
pub const DEFAULT_PROVIDER: Provider = FIREWORKS;

pub fn lookup(id: &str) -> Option<Provider> {
    PROVIDERS.iter().copied().find(|p| p.id == id)
}

/// Rough context size: character count of everything sent to the model.
pub fn estimate_tokens(prompt: &str, previous_prompt: Option<&str>, html: Option<&str>) -> usize {
    let count = |s: &str| s.chars().count();
    count(prompt) + previous_prompt.map_or(0, count) + html.map_or(0, count)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Use(Provider),
    /// The caller pinned a provider whose ceiling the context does not fit.
    ContextTooLong(Provider),
}

/// `auto` picks SambaNova for small contexts and the default otherwise. Any
/// other choice is honoured as long as the context fits under its ceiling;
/// unknown or missing names fall back to the default and are checked the same way.
pub fn select(requested: Option<&str>, tokens: usize) -> Selection {
    if requested == Some(AUTO.id) {
        let provider = if tokens < SAMBANOVA.max_tokens { SAMBANOVA } else { DEFAULT_PROVIDER };
        return Selection::Use(provider);
    }

    let provider = requested.and_then(lookup).unwrap_or(DEFAULT_PROVIDER);
    if tokens >= provider.max_tokens {
        Selection::ContextTooLong(provider)
    } else {
        Selection::Use(provider)
    }
}

/// `max_tokens` sent upstream; SambaNova rejects the parameter.
pub fn request_max_tokens(provider: Provider) -> Option<usize> {
    (provider.id != SAMBANOVA.id).then_some(provider.max_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_counts_every_part() {
        assert_eq!(estimate_tokens("abc", None, None), 3);
        assert_eq!(estimate_tokens("abc", Some("de"), Some("<p>")), 8);
    }

    #[test]
    fn auto_prefers_sambanova_for_small_contexts() {
        assert_eq!(select(Some("auto"), 10), Selection::Use(SAMBANOVA));
        assert_eq!(select(Some("auto"), 7_999), Selection::Use(SAMBANOVA));
        assert_eq!(select(Some("auto"), 8_000), Selection::Use(FIREWORKS));
    }

    #[test]
    fn named_provider_is_checked_against_its_ceiling() {
        assert_eq!(select(Some("novita"), 15_999), Selection::Use(NOVITA));
        assert_eq!(select(Some("novita"), 16_000), Selection::ContextTooLong(NOVITA));
    }

    #[test]
    fn unknown_provider_falls_back_to_default() {
        assert_eq!(select(Some("nope"), 100), Selection::Use(FIREWORKS));
    }

    #[test]
    fn missing_provider_is_not_auto() {
        assert_eq!(select(None, 100), Selection::Use(FIREWORKS));
        assert_eq!(select(None, 131_000), Selection::ContextTooLong(FIREWORKS));
    }

    #[test]
    fn sambanova_gets_no_max_tokens() {
        assert_eq!(request_max_tokens(SAMBANOVA), None);
        assert_eq!(request_max_tokens(NEBIUS), Some(131_000));
    }
}
