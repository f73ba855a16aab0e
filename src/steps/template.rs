//! `{source.path}` placeholders in step configuration strings.
//!
//! Only the known sources (`random`, `steps`) are recognised as placeholders.
//! Any other brace-delimited text is kept verbatim, so scripts and JSON
//! snippets pass through untouched.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

pub const SOURCE_RANDOM: &str = "random";
pub const SOURCE_STEPS: &str = "steps";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(random|steps)\.([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\}")
        .expect("placeholder regex is valid")
});

/// Step outputs keyed by step type, then output key.
pub type StepOutputs = HashMap<String, HashMap<String, String>>;

/// Errors raised while parsing or rendering templates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template source {name:?} is not available here (in {template:?})")]
    UnsupportedSource { name: String, template: String },

    #[error("no resolver registered for template source {0:?}")]
    NoResolver(String),

    #[error("invalid field name {0:?}: must be in format stepType.outputKey")]
    InvalidField(String),

    #[error("step type {0:?} not found in outputs")]
    StepTypeNotFound(String),

    #[error("output key {key:?} not found for step type {step_type:?}")]
    OutputKeyNotFound { key: String, step_type: String },

    #[error("unknown random field {0:?}: supported fields are \"id\" and \"port\"")]
    UnknownRandomField(String),

    #[error("failed to generate random {field}: {reason}")]
    Random { field: String, reason: String },
}

/// Something that can answer `{source.field}` lookups for one source.
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, field: &str) -> Result<String, TemplateError>;
}

/// The set of resolvers available while rendering.
#[derive(Default)]
pub struct Sources<'a> {
    entries: Vec<(&'static str, &'a dyn SourceResolver)>,
}

impl<'a> Sources<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: &'static str, resolver: &'a dyn SourceResolver) -> Self {
        self.entries.push((source, resolver));
        self
    }

    fn get(&self, source: &str) -> Option<&'a dyn SourceResolver> {
        self.entries
            .iter()
            .find(|(name, _)| *name == source)
            .map(|(_, r)| *r)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Ref { source: String, field: String },
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parses `raw`, accepting only placeholders from `allowed` sources.
    pub fn parse(raw: &str, allowed: &[&str]) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(raw) {
            let (Some(whole), Some(source), Some(field)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };

            if !allowed.contains(&source.as_str()) {
                return Err(TemplateError::UnsupportedSource {
                    name: source.as_str().to_string(),
                    template: raw.to_string(),
                });
            }

            if whole.start() > last {
                segments.push(Segment::Literal(raw[last..whole.start()].to_string()));
            }
            segments.push(Segment::Ref {
                source: source.as_str().to_string(),
                field: field.as_str().to_string(),
            });
            last = whole.end();
        }

        if last < raw.len() {
            segments.push(Segment::Literal(raw[last..].to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The original, unrendered text.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// True when the template contains no placeholders.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Renders the template, failing on the first unresolvable placeholder.
    pub fn render(&self, sources: &Sources<'_>) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Ref { source, field } => {
                    let resolver = sources
                        .get(source)
                        .ok_or_else(|| TemplateError::NoResolver(source.clone()))?;
                    out.push_str(&resolver.resolve(field)?);
                }
            }
        }
        Ok(out)
    }
}

/// Resolves `steps.<stepType>.<outputKey>` against accumulated step outputs.
///
/// The step type may itself contain dots (`kubernetes.listContexts`), so the
/// field is split on its last dot.
pub struct StepOutputResolver<'a> {
    outputs: &'a StepOutputs,
}

impl<'a> StepOutputResolver<'a> {
    pub fn new(outputs: &'a StepOutputs) -> Self {
        Self { outputs }
    }
}

impl SourceResolver for StepOutputResolver<'_> {
    fn resolve(&self, field: &str) -> Result<String, TemplateError> {
        let (step_type, key) = field
            .rsplit_once('.')
            .ok_or_else(|| TemplateError::InvalidField(field.to_string()))?;

        let outputs = self
            .outputs
            .get(step_type)
            .ok_or_else(|| TemplateError::StepTypeNotFound(step_type.to_string()))?;

        outputs
            .get(key)
            .cloned()
            .ok_or_else(|| TemplateError::OutputKeyNotFound {
                key: key.to_string(),
                step_type: step_type.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs() -> StepOutputs {
        let mut outputs = StepOutputs::new();
        outputs.insert(
            "kubernetes.listContexts".to_string(),
            HashMap::from([("current".to_string(), "kind-kind".to_string())]),
        );
        outputs
    }

    #[test]
    fn test_resolves_dotted_step_type() {
        let outputs = outputs();
        let resolver = StepOutputResolver::new(&outputs);
        let tpl = Template::parse(
            "current context is {steps.kubernetes.listContexts.current}",
            &[SOURCE_STEPS],
        )
        .unwrap();

        let rendered = tpl
            .render(&Sources::new().with(SOURCE_STEPS, &resolver))
            .unwrap();
        assert_eq!(rendered, "current context is kind-kind");
    }

    #[test]
    fn test_missing_output_key_is_error() {
        let outputs = outputs();
        let resolver = StepOutputResolver::new(&outputs);
        let tpl = Template::parse("{steps.kubernetes.listContexts.missing}", &[SOURCE_STEPS])
            .unwrap();

        let err = tpl
            .render(&Sources::new().with(SOURCE_STEPS, &resolver))
            .unwrap_err();
        assert_eq!(
            err,
            TemplateError::OutputKeyNotFound {
                key: "missing".into(),
                step_type: "kubernetes.listContexts".into()
            }
        );
    }

    #[test]
    fn test_missing_step_type_and_bad_field() {
        let outputs = outputs();
        let resolver = StepOutputResolver::new(&outputs);
        assert_eq!(
            resolver.resolve("http.status").unwrap_err(),
            TemplateError::StepTypeNotFound("http".into())
        );
        assert_eq!(
            resolver.resolve("nodots").unwrap_err(),
            TemplateError::InvalidField("nodots".into())
        );
    }

    #[test]
    fn test_unknown_braces_are_literal() {
        let tpl = Template::parse(r#"echo '{"a": 1}' {other.thing}"#, &[SOURCE_STEPS]).unwrap();
        assert!(tpl.is_static());
        assert_eq!(
            tpl.render(&Sources::new()).unwrap(),
            r#"echo '{"a": 1}' {other.thing}"#
        );
    }

    #[test]
    fn test_disallowed_source_rejected() {
        let err = Template::parse("http://x/{steps.a.b}", &[SOURCE_RANDOM]).unwrap_err();
        assert!(matches!(err, TemplateError::UnsupportedSource { ref name, .. } if name == "steps"));
        assert_eq!(
            err.to_string(),
            r#"template source "steps" is not available here (in "http://x/{steps.a.b}")"#
        );
    }

    #[test]
    fn test_missing_resolver() {
        let tpl = Template::parse("{random.id}", &[SOURCE_RANDOM]).unwrap();
        assert_eq!(
            tpl.render(&Sources::new()).unwrap_err(),
            TemplateError::NoResolver("random".into())
        );
    }
}
