//! YAML frontmatter extraction.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_yaml::Value;

/// Flattened frontmatter: top-level keys with scalar or list values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Frontmatter {
    values: BTreeMap<String, FrontmatterValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FrontmatterValue {
    Text(String),
    List(Vec<String>),
}

impl Frontmatter {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FrontmatterValue> {
        self.values.get(key)
    }

    /// Scalar value, or the first list element.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        let value = match self.values.get(key)? {
            FrontmatterValue::Text(text) => Some(text.as_str()),
            FrontmatterValue::List(items) => items.first().map(String::as_str),
        };
        value.filter(|value| !value.trim().is_empty())
    }

    /// List value; a scalar is split on commas.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.values.get(key) {
            Some(FrontmatterValue::List(items)) => items.clone(),
            Some(FrontmatterValue::Text(text)) => text
                .split(',')
                .map(|item| item.trim().trim_start_matches('#').to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FrontmatterValue)> {
        self.values.iter()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FrontmatterValue) {
        self.values.insert(key.into(), value);
    }
}

impl FrontmatterValue {
    pub fn to_text(&self) -> String {
        match self {
            FrontmatterValue::Text(text) => text.clone(),
            FrontmatterValue::List(items) => items.join(", "),
        }
    }
}

/// Result of splitting a document into frontmatter and body.
#[derive(Debug, Clone, Default)]
pub struct Split {
    pub frontmatter: Frontmatter,
    /// Number of lines the frontmatter block occupies, delimiters included.
    pub lines: usize,
    pub error: Option<String>,
}

/// Split a leading `---` YAML block off `text`.
pub fn split(text: &str) -> Split {
    let mut lines = text.lines();
    if lines.next().map(str::trim_end) != Some("---") {
        return Split::default();
    }

    let mut yaml = String::new();
    let mut consumed = 1;
    let mut closed = false;
    for line in lines {
        consumed += 1;
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            closed = true;
            break;
        }
        yaml.push_str(line);
        yaml.push('\n');
    }
    if !closed {
        return Split::default();
    }

    match parse_yaml(&yaml) {
        Ok(frontmatter) => Split {
            frontmatter,
            lines: consumed,
            error: None,
        },
        Err(message) => Split {
            frontmatter: Frontmatter::default(),
            lines: consumed,
            error: Some(message),
        },
    }
}

fn parse_yaml(yaml: &str) -> Result<Frontmatter, String> {
    if yaml.trim().is_empty() {
        return Ok(Frontmatter::default());
    }
    let value: Value = serde_yaml::from_str(yaml).map_err(|err| err.to_string())?;
    let mapping = match value {
        Value::Mapping(mapping) => mapping,
        Value::Null => return Ok(Frontmatter::default()),
        _ => return Err("frontmatter is not a mapping".to_string()),
    };

    let mut frontmatter = Frontmatter::default();
    for (key, value) in mapping {
        let Some(key) = scalar_text(&key) else { continue };
        let converted = match value {
            Value::Sequence(items) => {
                FrontmatterValue::List(items.iter().filter_map(scalar_text).collect())
            }
            other => match scalar_text(&other) {
                Some(text) => FrontmatterValue::Text(text),
                None => continue,
            },
        };
        frontmatter.insert(key, converted);
    }
    Ok(frontmatter)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Tagged(tagged) => scalar_text(&tagged.value),
        _ => None,
    }
}
