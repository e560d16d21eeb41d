//! Model selection policy for spawned teammates.
//!
//! A pure, total resolver: every input yields either a [`ModelChoice`]
//! with a definite source, or a [`ModelPolicyError`], nothing else.

/// Where the resolved model came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Override,
    InheritLeader,
    Default,
}

impl ModelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSource::Override => "override",
            ModelSource::InheritLeader => "inherit_leader",
            ModelSource::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub source: ModelSource,
    pub provider: Option<String>,
    pub model_id: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ModelPolicyError {
    #[error("invalid_override")]
    InvalidOverride,
    #[error("deprecated_override")]
    DeprecatedOverride,
}

/// Inputs to the resolver; all optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelPolicyInput<'a> {
    pub model_override: Option<&'a str>,
    pub leader_provider: Option<&'a str>,
    pub leader_model_id: Option<&'a str>,
}

/// Deprecation markers paired with the suffixes that exempt a match.
/// A model id is deprecated iff a marker occurs in the lowercased id and
/// is not immediately followed by one of its allowed extensions.
const DEPRECATED_MARKERS: &[(&str, &[&str])] = &[
    ("claude-sonnet-4", &["-5", ".5"]),
    ("claude-opus-4", &["-5", ".5"]),
    ("claude-3", &[]),
    ("gpt-4o", &[]),
];

/// Whether a model id matches a deprecation marker.
pub fn is_deprecated_model(model_id: &str) -> bool {
    let lower = model_id.to_lowercase();
    for (marker, allowed) in DEPRECATED_MARKERS {
        let mut search = lower.as_str();
        let mut base = 0;
        while let Some(pos) = search.find(marker) {
            let after = &lower[base + pos + marker.len()..];
            if !allowed.iter().any(|ext| after.starts_with(ext)) {
                return true;
            }
            base += pos + marker.len();
            search = &lower[base..];
        }
    }
    false
}

/// Resolve the model for a new teammate.
///
/// - `provider/model` override: both halves must be non-empty, model must
///   not be deprecated.
/// - bare `model` override: must not be deprecated; inherits the leader
///   provider when known, otherwise records a warning.
/// - no override: inherit the leader's provider+model when present and
///   not deprecated; otherwise fall back to the runtime default.
pub fn resolve_model(input: ModelPolicyInput<'_>) -> Result<ModelChoice, ModelPolicyError> {
    if let Some(raw) = input.model_override {
        let raw = raw.trim();
        if let Some((provider, model_id)) = raw.split_once('/') {
            if provider.is_empty() || model_id.is_empty() {
                return Err(ModelPolicyError::InvalidOverride);
            }
            if is_deprecated_model(model_id) {
                return Err(ModelPolicyError::DeprecatedOverride);
            }
            return Ok(ModelChoice {
                source: ModelSource::Override,
                provider: Some(provider.to_string()),
                model_id: Some(model_id.to_string()),
                warnings: Vec::new(),
            });
        }

        if raw.is_empty() {
            return Err(ModelPolicyError::InvalidOverride);
        }
        if is_deprecated_model(raw) {
            return Err(ModelPolicyError::DeprecatedOverride);
        }
        let (provider, warnings) = match input.leader_provider {
            Some(p) if !p.is_empty() => (Some(p.to_string()), Vec::new()),
            _ => (
                None,
                vec![format!(
                    "leader provider unknown; \"{raw}\" will use the runtime default provider"
                )],
            ),
        };
        return Ok(ModelChoice {
            source: ModelSource::Override,
            provider,
            model_id: Some(raw.to_string()),
            warnings,
        });
    }

    if let Some(model_id) = input.leader_model_id {
        if !model_id.is_empty() && !is_deprecated_model(model_id) {
            return Ok(ModelChoice {
                source: ModelSource::InheritLeader,
                provider: input.leader_provider.map(|p| p.to_string()),
                model_id: Some(model_id.to_string()),
                warnings: Vec::new(),
            });
        }
    }

    Ok(ModelChoice {
        source: ModelSource::Default,
        provider: None,
        model_id: None,
        warnings: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_inherits_leader_provider() {
        let choice = resolve_model(ModelPolicyInput {
            model_override: Some("codex-mini"),
            leader_provider: Some("openai-codex"),
            leader_model_id: Some("codex-mini"),
        })
        .unwrap();
        assert_eq!(choice.source, ModelSource::Override);
        assert_eq!(choice.provider.as_deref(), Some("openai-codex"));
        assert_eq!(choice.model_id.as_deref(), Some("codex-mini"));
        assert!(choice.warnings.is_empty());
    }

    #[test]
    fn override_with_empty_half_is_invalid() {
        let err = resolve_model(ModelPolicyInput {
            model_override: Some("openai-codex/"),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err, ModelPolicyError::InvalidOverride);

        let err = resolve_model(ModelPolicyInput {
            model_override: Some("/codex-mini"),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err, ModelPolicyError::InvalidOverride);
    }

    #[test]
    fn qualified_override_splits_once() {
        let choice = resolve_model(ModelPolicyInput {
            model_override: Some("openai-codex/codex-mini"),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(choice.provider.as_deref(), Some("openai-codex"));
        assert_eq!(choice.model_id.as_deref(), Some("codex-mini"));
    }

    #[test]
    fn bare_override_without_leader_provider_warns() {
        let choice = resolve_model(ModelPolicyInput {
            model_override: Some("codex-mini"),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(choice.source, ModelSource::Override);
        assert!(choice.provider.is_none());
        assert_eq!(choice.warnings.len(), 1);
    }

    #[test]
    fn deprecated_override_fails() {
        let err = resolve_model(ModelPolicyInput {
            model_override: Some("claude-sonnet-4-20250514"),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err, ModelPolicyError::DeprecatedOverride);
    }

    #[test]
    fn marker_with_allowed_extension_is_not_deprecated() {
        assert!(!is_deprecated_model("claude-sonnet-4-5"));
        assert!(!is_deprecated_model("claude-sonnet-4.5-latest"));
        assert!(is_deprecated_model("claude-sonnet-4-20250514"));
        assert!(is_deprecated_model("Claude-Opus-4"));
        assert!(!is_deprecated_model("codex-mini"));
    }

    #[test]
    fn no_override_inherits_leader() {
        let choice = resolve_model(ModelPolicyInput {
            model_override: None,
            leader_provider: Some("anthropic"),
            leader_model_id: Some("claude-sonnet-4-5"),
        })
        .unwrap();
        assert_eq!(choice.source, ModelSource::InheritLeader);
        assert_eq!(choice.provider.as_deref(), Some("anthropic"));
    }

    #[test]
    fn deprecated_leader_model_falls_back_to_default() {
        let choice = resolve_model(ModelPolicyInput {
            model_override: None,
            leader_provider: Some("anthropic"),
            leader_model_id: Some("claude-3-opus"),
        })
        .unwrap();
        assert_eq!(choice.source, ModelSource::Default);
        assert!(choice.model_id.is_none());
    }

    #[test]
    fn empty_input_resolves_to_default() {
        let choice = resolve_model(ModelPolicyInput::default()).unwrap();
        assert_eq!(choice.source, ModelSource::Default);
        assert!(choice.provider.is_none());
        assert!(choice.warnings.is_empty());
    }
}
