use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;

use super::node::{AttrValue, Node};
use crate::error::{SyncError, SyncResult};

/// An element whose children are still being read
struct OpenElement {
    tag: String,
    attributes: BTreeMap<String, AttrValue>,
    children: Vec<Node>,
}

impl OpenElement {
    fn push_text(&mut self, content: &str) {
        if let Some(Node::Text { content: last, marks }) = self.children.last_mut() {
            if marks.is_empty() {
                last.push_str(content);
                return;
            }
        }
        self.children.push(Node::text(content));
    }

    fn finish(self) -> Node {
        Node::Element {
            tag: self.tag,
            attributes: self.attributes,
            children: significant(self.children),
        }
    }
}

fn significant(children: Vec<Node>) -> Vec<Node> {
    children
        .into_iter()
        .filter(|node| !node.is_insignificant_text())
        .collect()
}

/// Parse markup into an ordered sequence of top-level nodes.
///
/// The input may hold several top-level nodes; they are read under a synthetic
/// root that is not part of the result. Tag names keep their casing, attribute
/// values are classified with [`AttrValue::parse`]. Any syntax error fails the
/// whole parse.
pub fn parse_markup(markup: &str) -> SyncResult<Vec<Node>> {
    let mut reader = Reader::from_str(markup);
    let mut stack = vec![OpenElement {
        tag: String::new(),
        attributes: BTreeMap::new(),
        children: Vec::new(),
    }];

    loop {
        let event = reader.read_event().map_err(|e| {
            SyncError::Markup(format!("at byte {}: {}", reader.buffer_position(), e))
        })?;

        match event {
            Event::Start(start) => stack.push(open_element(&start)?),
            Event::Empty(start) => {
                let element = open_element(&start)?.finish();
                push_child(&mut stack, element);
            }
            Event::End(_) => {
                if stack.len() == 1 {
                    return Err(SyncError::Markup(format!(
                        "unexpected closing tag at byte {}",
                        reader.buffer_position()
                    )));
                }
                if let Some(element) = stack.pop() {
                    push_child(&mut stack, element.finish());
                }
            }
            Event::Text(text) => {
                let content = text
                    .unescape()
                    .map_err(|e| SyncError::Markup(e.to_string()))?;
                if let Some(top) = stack.last_mut() {
                    top.push_text(&content);
                }
            }
            Event::CData(data) => {
                let content = String::from_utf8(data.into_inner().into_owned())
                    .map_err(|e| SyncError::Markup(e.to_string()))?;
                if let Some(top) = stack.last_mut() {
                    top.push_text(&content);
                }
            }
            Event::Eof => break,
            // Comments, declarations and processing instructions carry no content
            _ => {}
        }
    }

    if stack.len() != 1 {
        let unclosed = stack.last().map(|e| e.tag.clone()).unwrap_or_default();
        return Err(SyncError::Markup(format!("unclosed element <{}>", unclosed)));
    }

    Ok(stack
        .pop()
        .map(|root| significant(root.children))
        .unwrap_or_default())
}

fn open_element(start: &BytesStart<'_>) -> SyncResult<OpenElement> {
    let tag = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| SyncError::Markup(e.to_string()))?
        .to_string();

    let mut attributes = BTreeMap::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| SyncError::Markup(e.to_string()))?;
        let name = std::str::from_utf8(attribute.key.as_ref())
            .map_err(|e| SyncError::Markup(e.to_string()))?
            .to_string();
        let value = attribute
            .unescape_value()
            .map_err(|e| SyncError::Markup(e.to_string()))?;
        attributes.insert(name, AttrValue::parse(&value));
    }

    Ok(OpenElement {
        tag,
        attributes,
        children: Vec::new(),
    })
}

fn push_child(stack: &mut [OpenElement], node: Node) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

/// Render nodes back to markup.
///
/// Marked text is wrapped in one element per mark, named after the mark type,
/// so the output is meant for display and diagnostics rather than re-import.
pub fn to_markup(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        render(node, &mut out);
    }
    out
}

fn render(node: &Node, out: &mut String) {
    match node {
        Node::Element {
            tag,
            attributes,
            children,
        } => {
            out.push('<');
            out.push_str(tag);
            for (name, value) in attributes {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                out.push_str(&escape(value.to_raw().as_str()));
                out.push('"');
            }
            if children.is_empty() {
                out.push_str("/>");
                return;
            }
            out.push('>');
            for child in children {
                render(child, out);
            }
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
        Node::Text { content, marks } => {
            for mark in marks {
                out.push('<');
                out.push_str(&mark.mark_type);
                out.push('>');
            }
            out.push_str(&escape(content.as_str()));
            for mark in marks.iter().rev() {
                out.push_str("</");
                out.push_str(&mark.mark_type);
                out.push('>');
            }
        }
    }
}
