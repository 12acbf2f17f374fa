//! Upstream provider clients and the model -> adapter router (spec §4.8).

pub mod anthropic;
pub mod openai;

use serde::Deserialize;

use self::anthropic::AnthropicProvider;
use self::openai::OpenAIProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamAdapter {
    OpenAI,
    Anthropic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelRoute {
    /// Prefix or exact model name to match; `"*"` matches anything not
    /// otherwise matched, and must be the last entry.
    pub pattern: String,
    pub adapter: UpstreamAdapter,
}

/// Routes a model name to the adapter that should serve it. Longest
/// matching prefix wins; `"*"` is the catch-all fallback.
pub fn route_model<'a>(routes: &'a [ModelRoute], model: &str) -> Option<&'a ModelRoute> {
    let mut best: Option<&ModelRoute> = None;
    for route in routes {
        if route.pattern == "*" {
            if best.is_none() {
                best = Some(route);
            }
            continue;
        }
        if model.starts_with(route.pattern.as_str()) {
            match best {
                Some(current) if current.pattern.len() >= route.pattern.len() => {}
                _ => best = Some(route),
            }
        }
    }
    best
}

pub struct ProviderClients {
    pub openai: OpenAIProvider,
    pub anthropic: AnthropicProvider,
}

impl ProviderClients {
    pub fn adapter_for(&self, routes: &[ModelRoute], model: &str) -> UpstreamAdapter {
        route_model(routes, model)
            .map(|r| r.adapter)
            .unwrap_or(UpstreamAdapter::OpenAI)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins_over_catch_all() {
        let routes = vec![
            ModelRoute {
                pattern: "*".into(),
                adapter: UpstreamAdapter::OpenAI,
            },
            ModelRoute {
                pattern: "claude-".into(),
                adapter: UpstreamAdapter::Anthropic,
            },
        ];
        let matched = route_model(&routes, "claude-3-opus").unwrap();
        assert_eq!(matched.adapter, UpstreamAdapter::Anthropic);
        let fallback = route_model(&routes, "gpt-4").unwrap();
        assert_eq!(fallback.adapter, UpstreamAdapter::OpenAI);
    }
}
