use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Attribute value of an element node.
///
/// The kind is decided once, when the raw attribute string is parsed:
/// anything that parses as a JSON number, boolean, null, array or object is
/// `Structured`, everything else (JSON string literals included, unquoted)
/// is `Text`. `Structured` never holds a JSON string.
///
/// [`AttrValue::to_raw`] quotes text that would otherwise read back as
/// JSON, so `parse(to_raw(v)) == v` for every value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Text(String),
    Structured(JsonValue),
}

impl AttrValue {
    /// Classify a raw attribute string
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<JsonValue>(raw) {
            Ok(JsonValue::String(text)) => AttrValue::Text(text),
            Ok(value) => AttrValue::Structured(value),
            Err(_) => AttrValue::Text(raw.to_string()),
        }
    }

    /// The raw string form stored on replicated elements and in markup
    pub fn to_raw(&self) -> String {
        match self {
            AttrValue::Structured(JsonValue::String(text)) => quote(text),
            AttrValue::Structured(value) => value.to_string(),
            AttrValue::Text(text) if serde_json::from_str::<JsonValue>(text).is_ok() => quote(text),
            AttrValue::Text(text) => text.clone(),
        }
    }
}

fn quote(text: &str) -> String {
    JsonValue::String(text.to_string()).to_string()
}

impl From<&str> for AttrValue {
    fn from(raw: &str) -> Self {
        AttrValue::parse(raw)
    }
}

impl From<JsonValue> for AttrValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::String(text) => AttrValue::Text(text),
            value => AttrValue::Structured(value),
        }
    }
}

/// Inline formatting applied to a text run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub mark_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, JsonValue>,
}

impl Mark {
    pub fn new(mark_type: impl Into<String>) -> Self {
        Self {
            mark_type: mark_type.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

/// Rich-text interchange node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    Element {
        tag: String,
        #[serde(default)]
        attributes: BTreeMap<String, AttrValue>,
        #[serde(default)]
        children: Vec<Node>,
    },
    Text {
        content: String,
        #[serde(default)]
        marks: Vec<Mark>,
    },
}

impl Node {
    pub fn element(tag: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Element {
            tag: tag.into(),
            attributes: BTreeMap::new(),
            children,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Node::Text {
            content: content.into(),
            marks: Vec::new(),
        }
    }

    pub fn marked_text(content: impl Into<String>, marks: Vec<Mark>) -> Self {
        Node::Text {
            content: content.into(),
            marks,
        }
    }

    /// Add an attribute to an element node. No-op on text nodes.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        if let Node::Element { attributes, .. } = &mut self {
            attributes.insert(name.into(), value.into());
        }
        self
    }

    /// Whether a text node carries no significant content.
    ///
    /// Whitespace-only runs are insignificant, a single space is kept.
    pub fn is_insignificant_text(&self) -> bool {
        match self {
            Node::Text { content, .. } => content.trim().is_empty() && content != " ",
            Node::Element { .. } => false,
        }
    }
}

/// Structural form used to compare trees: insignificant text dropped and marks
/// ordered by type at every level.
pub fn normalize(nodes: &[Node]) -> Vec<Node> {
    nodes
        .iter()
        .filter(|node| !node.is_insignificant_text())
        .map(|node| match node {
            Node::Element {
                tag,
                attributes,
                children,
            } => Node::Element {
                tag: tag.clone(),
                attributes: attributes.clone(),
                children: normalize(children),
            },
            Node::Text { content, marks } => {
                let mut marks = marks.clone();
                marks.sort_by(|a, b| a.mark_type.cmp(&b.mark_type));
                Node::Text {
                    content: content.clone(),
                    marks,
                }
            }
        })
        .collect()
}
