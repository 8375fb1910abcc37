//! Deterministic caption/text rewrite with `{name}` placeholders.
//!
//! Escape sequences are expanded before substitution; unknown placeholder
//! names pass through literally. Variable resolution order, later overrides
//! earlier: item-derived, time-of-render, template-author statics,
//! caller-supplied extras.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{DomainError, DownloadedItem};
use crate::shared::files::format_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemplateMode {
    #[default]
    Original,
    Custom,
}

/// Author-defined variable; an extractor pattern wires a text-derived value
/// into the rendering path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(default)]
    pub extractor_pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemplateDefinition {
    pub mode: TemplateMode,
    #[serde(default)]
    pub body: String,
    /// Template-author static values.
    #[serde(default)]
    pub values: HashMap<String, String>,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
}

impl TemplateDefinition {
    pub fn original() -> Self {
        Self::default()
    }

    pub fn custom(body: impl Into<String>) -> Self {
        Self { mode: TemplateMode::Custom, body: body.into(), ..Default::default() }
    }

    /// Load a full definition document (JSON) written by a template author.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, DomainError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| DomainError::Template(format!("{}: {e}", path.display())))
    }

    /// Startup validation; any returned error is fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.mode == TemplateMode::Custom && self.body.is_empty() {
            errors.push("content required".into());
        }
        for variable in &self.variables {
            if let Some(pattern) = &variable.extractor_pattern {
                if let Err(e) = Regex::new(pattern) {
                    errors.push(format!("variable '{}': invalid pattern: {e}", variable.name));
                }
            }
        }
        errors
    }
}

pub struct TemplateEngine {
    definition: TemplateDefinition,
    placeholder: Regex,
    extractors: Vec<(String, Regex)>,
}

impl TemplateEngine {
    pub fn new(definition: TemplateDefinition) -> Result<Self, DomainError> {
        let errors = definition.validate();
        if !errors.is_empty() {
            return Err(DomainError::Template(errors.join("; ")));
        }
        let mut extractors = Vec::new();
        for variable in &definition.variables {
            if let Some(pattern) = &variable.extractor_pattern {
                let regex = Regex::new(pattern)
                    .map_err(|e| DomainError::Template(format!("invalid pattern: {e}")))?;
                extractors.push((variable.name.clone(), regex));
            }
        }
        Ok(Self {
            definition,
            placeholder: Regex::new(r"\{([^}]+)\}").expect("static pattern"),
            extractors,
        })
    }

    /// Render the caption for one downloaded item.
    pub fn render(&self, item: &DownloadedItem, extras: &HashMap<String, String>) -> String {
        match self.definition.mode {
            TemplateMode::Original => render_original(item),
            TemplateMode::Custom => self.render_custom(item, extras),
        }
    }

    fn render_custom(&self, item: &DownloadedItem, extras: &HashMap<String, String>) -> String {
        let body = expand_escapes(&self.definition.body);
        let variables = self.build_variables(item, extras);
        self.placeholder
            .replace_all(&body, |captures: &regex::Captures<'_>| {
                let name = captures[1].trim();
                variables
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| captures[0].to_string())
            })
            .into_owned()
    }

    fn build_variables(
        &self,
        item: &DownloadedItem,
        extras: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut variables = HashMap::new();

        variables.insert("original_text".into(), item.text.clone().unwrap_or_default());
        variables.insert("original_caption".into(), item.caption.clone().unwrap_or_default());
        variables.insert("file_name".into(), item.file_name.clone());
        variables.insert("file_size".into(), item.size().to_string());
        variables.insert("file_size_formatted".into(), format_size(item.size()));
        variables.insert("message_id".into(), item.message_id.to_string());
        variables.insert("client_name".into(), item.session.clone());

        let now = chrono::Local::now();
        variables.insert("timestamp".into(), now.timestamp().to_string());
        variables.insert("date".into(), now.format("%Y-%m-%d").to_string());
        variables.insert("time".into(), now.format("%H:%M:%S").to_string());
        variables.insert("datetime".into(), now.format("%Y-%m-%d %H:%M:%S").to_string());

        // Author-wired extractor variables read from the item's own text.
        let source_text = source_text(item);
        for (name, regex) in &self.extractors {
            if let Some(found) = first_match(regex, &source_text) {
                variables.insert(name.clone(), found);
            }
        }

        for (key, value) in &self.definition.values {
            variables.insert(key.clone(), value.clone());
        }
        for (key, value) in extras {
            variables.insert(key.clone(), value.clone());
        }
        variables
    }

    /// Render against a sample item for template authoring.
    pub fn preview(&self, extras: &HashMap<String, String>) -> String {
        let sample = DownloadedItem {
            message_id: 12345,
            session: "preview_client".into(),
            kind: crate::domain::MediaKind::Photo,
            file_name: "sample_file.jpg".into(),
            text: Some("sample message text".into()),
            caption: Some("sample caption".into()),
            group_id: None,
            meta: Default::default(),
            payload: crate::domain::ItemPayload::InMemory {
                bytes: b"sample data".to_vec(),
                md5_hex: String::new(),
            },
        };
        self.render(&sample, extras)
    }

    /// Placeholder names appearing in the body.
    pub fn placeholders(&self) -> Vec<String> {
        self.placeholder
            .captures_iter(&self.definition.body)
            .map(|c| c[1].trim().to_string())
            .collect()
    }
}

fn render_original(item: &DownloadedItem) -> String {
    let mut parts = Vec::new();
    if let Some(text) = item.text.as_deref().filter(|t| !t.is_empty()) {
        parts.push(text);
    }
    if let Some(caption) = item.caption.as_deref().filter(|c| !c.is_empty()) {
        parts.push(caption);
    }
    parts.join("\n")
}

fn source_text(item: &DownloadedItem) -> String {
    match (item.text.as_deref(), item.caption.as_deref()) {
        (Some(text), Some(caption)) => format!("{text}\n{caption}"),
        (Some(text), None) => text.to_string(),
        (None, Some(caption)) => caption.to_string(),
        (None, None) => String::new(),
    }
}

/// Expand `\n \t \r \\` to their literal characters; unknown escapes are
/// kept verbatim.
fn expand_escapes(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn first_match(regex: &Regex, text: &str) -> Option<String> {
    regex.captures(text).map(|captures| {
        captures
            .get(1)
            .unwrap_or_else(|| captures.get(0).expect("match exists"))
            .as_str()
            .to_string()
    })
}

/// Scans arbitrary text for predefined value classes. Suggestion-only: it
/// feeds template authoring, not the render path.
pub struct VariableExtractor {
    patterns: Vec<(&'static str, Regex)>,
}

impl Default for VariableExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableExtractor {
    pub fn new() -> Self {
        let compiled = [
            ("hashtag", r"#(\w+)"),
            ("mention", r"@(\w+)"),
            ("url", r"https?://[^\s]+"),
            ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
            ("phone", r"\b\d{3}-\d{3}-\d{4}\b"),
            ("number", r"\b\d+\b"),
            ("price", r"\$\d+(?:\.\d{2})?"),
        ]
        .into_iter()
        .map(|(name, pattern)| (name, Regex::new(pattern).expect("static pattern")))
        .collect();
        Self { patterns: compiled }
    }

    /// First match per class, plus `<class>_all` with every match joined by
    /// ", ".
    pub fn extract(&self, text: &str) -> HashMap<String, String> {
        let mut found = HashMap::new();
        if text.is_empty() {
            return found;
        }
        for (name, regex) in &self.patterns {
            let matches: Vec<String> = regex
                .captures_iter(text)
                .map(|captures| {
                    captures
                        .get(1)
                        .unwrap_or_else(|| captures.get(0).expect("match exists"))
                        .as_str()
                        .to_string()
                })
                .collect();
            if let Some(first) = matches.first() {
                found.insert(name.to_string(), first.clone());
                found.insert(format!("{name}_all"), matches.join(", "));
            }
        }
        found
    }
}
