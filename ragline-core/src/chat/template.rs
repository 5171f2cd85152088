//! Prompt templates with `{name}` placeholders.
//!
//! Only identifier-shaped placeholders are substituted, so literal JSON
//! braces in a template pass through untouched.

use crate::error::TemplateError;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").ok());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    source: String,
}

impl PromptTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub async fn from_file(path: &Path) -> Result<Self, TemplateError> {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TemplateError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::new(source))
    }

    /// Placeholder names in order of first appearance.
    pub fn variables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        if let Some(re) = PLACEHOLDER.as_ref() {
            for cap in re.captures_iter(&self.source) {
                let name = &cap[1];
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }

    /// Substitute every placeholder. A placeholder without a value is an error.
    pub fn render<I, K, V>(&self, vars: I) -> Result<String, TemplateError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let values: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.to_string()))
            .collect();

        if let Some(missing) = self
            .variables()
            .into_iter()
            .find(|name| !values.contains_key(name))
        {
            return Err(TemplateError::MissingVariable { name: missing });
        }

        let Some(re) = PLACEHOLDER.as_ref() else {
            return Ok(self.source.clone());
        };
        Ok(re
            .replace_all(&self.source, |cap: &regex::Captures<'_>| {
                values.get(&cap[1]).cloned().unwrap_or_default()
            })
            .into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}
