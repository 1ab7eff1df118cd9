//! Prompt template expansion.
//!
//! Placeholders are expanded after upstream artifacts are injected into the
//! workspace and before the adapter is invoked, so `{{ artifacts.X }}`
//! always resolves to a path that exists.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Values available to a step prompt.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// The run's user input string.
    pub input: String,
    /// Matrix item bound to this worker, if any.
    pub task: Option<String>,
    /// Injected artifact alias -> workspace-relative path.
    pub artifacts: HashMap<String, String>,
    /// Timestamp override for deterministic tests; `Utc::now()` otherwise.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Expand `{{ input }}`, `{{ timestamp }}`, `{{ task }}`, and
/// `{{ artifacts.<alias> }}` placeholders. Unspaced variants are accepted.
/// Unknown placeholders are left in place.
pub fn expand(prompt: &str, ctx: &TemplateContext) -> String {
    let timestamp = ctx
        .timestamp
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let mut expanded = prompt
        .replace("{{ input }}", &ctx.input)
        .replace("{{input}}", &ctx.input)
        .replace("{{ timestamp }}", &timestamp)
        .replace("{{timestamp}}", &timestamp);

    if let Some(task) = &ctx.task {
        expanded = expanded
            .replace("{{ task }}", task)
            .replace("{{task}}", task);
    }

    for (alias, path) in &ctx.artifacts {
        expanded = expanded
            .replace(&format!("{{{{ artifacts.{alias} }}}}"), path)
            .replace(&format!("{{{{artifacts.{alias}}}}}"), path);
    }

    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_input_and_timestamp() {
        let ctx = TemplateContext {
            input: "ship the release".to_string(),
            timestamp: Some(
                DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
            ),
            ..TemplateContext::default()
        };
        let out = expand("Do: {{ input }} at {{ timestamp }}", &ctx);
        assert_eq!(out, "Do: ship the release at 2026-03-01T12:00:00Z");
    }

    #[test]
    fn expands_unspaced_variants() {
        let ctx = TemplateContext {
            input: "x".to_string(),
            ..TemplateContext::default()
        };
        assert_eq!(expand("{{input}}", &ctx), "x");
    }

    #[test]
    fn expands_artifacts_by_alias() {
        let mut artifacts = HashMap::new();
        artifacts.insert("input_a".to_string(), "artifacts/input_a".to_string());
        let ctx = TemplateContext {
            artifacts,
            ..TemplateContext::default()
        };
        assert_eq!(
            expand("Read {{ artifacts.input_a }} first", &ctx),
            "Read artifacts/input_a first"
        );
    }

    #[test]
    fn task_expands_only_when_bound() {
        let ctx = TemplateContext::default();
        assert_eq!(expand("work on {{ task }}", &ctx), "work on {{ task }}");

        let ctx = TemplateContext {
            task: Some("module-7".to_string()),
            ..TemplateContext::default()
        };
        assert_eq!(expand("work on {{ task }}", &ctx), "work on module-7");
    }

    #[test]
    fn unknown_placeholders_left_in_place() {
        let ctx = TemplateContext::default();
        assert_eq!(expand("{{ mystery }}", &ctx), "{{ mystery }}");
    }
}
