use std::collections::BTreeMap;
use tracing::{debug, warn};
use yrs::types::{Attrs, Value};
use yrs::{
    Any, ReadTxn, Text, TransactionMut, Xml, XmlElementPrelim, XmlElementRef, XmlFragment,
    XmlFragmentRef, XmlNode, XmlTextPrelim, XmlTextRef,
};

use super::markup::parse_markup;
use super::node::{AttrValue, Mark, Node};
use crate::connection::{DocumentConnection, UpdateOrigin};
use crate::error::SyncResult;

/// Replace the content of a connection's document with parsed markup.
///
/// Parsing happens before the transaction starts, so malformed markup leaves
/// the document untouched.
pub fn import_into(connection: &DocumentConnection, markup: &str) -> SyncResult<()> {
    let nodes = parse_markup(markup)?;
    import_nodes(connection, &nodes);
    Ok(())
}

/// Replace the content of a connection's document with a node sequence in one
/// transaction. The root is cleared, then every node is appended in order.
pub fn import_nodes(connection: &DocumentConnection, nodes: &[Node]) {
    connection.transact(UpdateOrigin::Import, |txn, root| {
        replace_content(txn, root, nodes);
    });
    debug!(
        "Imported {} top-level nodes into '{}'",
        nodes.len(),
        connection.id()
    );
}

/// Structural snapshot of a connection's live content
pub fn export_from(connection: &DocumentConnection) -> Vec<Node> {
    connection.read(|txn, root| read_children(txn, root))
}

/// Clear `root` and append `nodes` to it
pub fn replace_content(txn: &mut TransactionMut, root: &XmlFragmentRef, nodes: &[Node]) {
    let len = root.len(txn);
    if len > 0 {
        root.remove_range(txn, 0, len);
    }
    for node in nodes {
        append_node(txn, root, node);
    }
}

fn append_node<P: XmlFragment>(txn: &mut TransactionMut, parent: &P, node: &Node) {
    if node.is_insignificant_text() {
        return;
    }
    match node {
        Node::Element {
            tag,
            attributes,
            children,
        } => {
            let element: XmlElementRef =
                parent.push_back(txn, XmlElementPrelim::empty(tag.as_str()));
            for (name, value) in attributes {
                element.insert_attribute(txn, name.as_str(), value.to_raw());
            }
            for child in children {
                append_node(txn, &element, child);
            }
        }
        Node::Text { content, marks } => {
            if marks.is_empty() {
                parent.push_back(txn, XmlTextPrelim::new(content.as_str()));
            } else {
                let text: XmlTextRef = parent.push_back(txn, XmlTextPrelim::new(""));
                text.insert_with_attributes(txn, 0, content, marks_to_attrs(marks));
            }
        }
    }
}

/// Read every child of a fragment-like parent as interchange nodes
pub fn read_children<T: ReadTxn, P: XmlFragment>(txn: &T, parent: &P) -> Vec<Node> {
    let mut nodes = Vec::new();
    for index in 0..parent.len(txn) {
        match parent.get(txn, index) {
            Some(XmlNode::Element(element)) => nodes.push(read_element(txn, &element)),
            Some(XmlNode::Text(text)) => nodes.extend(read_text(txn, &text)),
            Some(XmlNode::Fragment(fragment)) => nodes.extend(read_children(txn, &fragment)),
            None => {}
        }
    }
    nodes
}

fn read_element<T: ReadTxn>(txn: &T, element: &XmlElementRef) -> Node {
    let mut attributes = BTreeMap::new();
    for (name, value) in element.attributes(txn) {
        attributes.insert(name.to_string(), AttrValue::parse(&value));
    }
    Node::Element {
        tag: element.tag().to_string(),
        attributes,
        children: read_children(txn, element),
    }
}

/// A replicated text may hold several differently formatted runs, each run
/// becomes one text node.
fn read_text<T: ReadTxn>(txn: &T, text: &XmlTextRef) -> Vec<Node> {
    text.diff(txn, |_| ())
        .into_iter()
        .filter_map(|chunk| {
            let content = match chunk.insert {
                Value::Any(Any::String(content)) => content.to_string(),
                other => {
                    debug!("Skipping embedded value in text: {:?}", other);
                    return None;
                }
            };
            let marks = chunk
                .attributes
                .map(|attrs| attrs_to_marks(&attrs))
                .unwrap_or_default();
            Some(Node::Text { content, marks })
        })
        .collect()
}

/// Marks are stored as text formatting attributes keyed by mark type. A mark
/// without attributes is stored as `true`, otherwise as its JSON-encoded attrs.
fn marks_to_attrs(marks: &[Mark]) -> Attrs {
    let mut attrs = Attrs::new();
    for mark in marks {
        let value = if mark.attrs.is_empty() {
            Any::Bool(true)
        } else {
            match serde_json::to_string(&mark.attrs) {
                Ok(json) => Any::String(json.into()),
                Err(_) => Any::Bool(true),
            }
        };
        attrs.insert(mark.mark_type.as_str().into(), value);
    }
    attrs
}

fn attrs_to_marks(attrs: &Attrs) -> Vec<Mark> {
    let mut marks: Vec<Mark> = attrs
        .iter()
        .filter_map(|(key, value)| match value {
            Any::Bool(true) => Some(Mark::new(key.to_string())),
            Any::String(json) => match serde_json::from_str(json) {
                Ok(attrs) => Some(Mark {
                    mark_type: key.to_string(),
                    attrs,
                }),
                Err(e) => {
                    warn!("Mark '{}' has unreadable attributes: {}", key, e);
                    Some(Mark::new(key.to_string()))
                }
            },
            // Null and false clear a format
            _ => None,
        })
        .collect();
    marks.sort_by(|a, b| a.mark_type.cmp(&b.mark_type));
    marks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::node::normalize;
    use rstest::rstest;
    use serde_json::json;
    use yrs::{Doc, Transact};

    fn round_trip(nodes: &[Node]) -> Vec<Node> {
        let doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("content");
        {
            let mut txn = doc.transact_mut();
            replace_content(&mut txn, &root, nodes);
        }
        let txn = doc.transact();
        read_children(&txn, &root)
    }

    fn sample_tree() -> Vec<Node> {
        vec![
            Node::element("heading", vec![Node::text("The Northern Reach")])
                .with_attribute("level", json!(1)),
            Node::element(
                "paragraph",
                vec![
                    Node::text("The city of "),
                    Node::marked_text(
                        "Vaelmoor",
                        vec![
                            Mark::new("bold"),
                            Mark::new("link").with_attr("href", json!("https://example.org")),
                        ],
                    ),
                    Node::text(" "),
                    Node::element("elementRef", vec![])
                        .with_attribute("elementId", "npc-42")
                        .with_attribute("meta", json!({"kind": "character", "tags": ["a", "b"]})),
                ],
            ),
            Node::element(
                "bulletList",
                vec![Node::element(
                    "listItem",
                    vec![Node::element("paragraph", vec![Node::text("first")])],
                )],
            ),
        ]
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let tree = sample_tree();
        assert_eq!(normalize(&round_trip(&tree)), normalize(&tree));
    }

    #[rstest]
    #[case("label", AttrValue::Text("42".to_string()))]
    #[case("flag", AttrValue::Text("true".to_string()))]
    #[case("empty", AttrValue::Text("null".to_string()))]
    #[case("quoted", AttrValue::Text("\"npc\"".to_string()))]
    #[case("count", AttrValue::Structured(json!(42)))]
    #[case("tags", AttrValue::Structured(json!(["a", "b"])))]
    fn test_round_trip_keeps_attribute_kind(#[case] name: &str, #[case] value: AttrValue) {
        let mut attributes = BTreeMap::new();
        attributes.insert(name.to_string(), value);
        let tree = vec![Node::Element {
            tag: "elementRef".to_string(),
            attributes,
            children: Vec::new(),
        }];
        assert_eq!(round_trip(&tree), tree);
    }

    #[test]
    fn test_round_trip_ignores_whitespace_only_text() {
        let mut tree = sample_tree();
        tree.insert(0, Node::text("\n    "));
        let exported = round_trip(&tree);
        assert_eq!(exported.len(), 3);
        assert_eq!(normalize(&exported), normalize(&tree));
    }

    #[test]
    fn test_replace_clears_previous_content() {
        let doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("content");
        {
            let mut txn = doc.transact_mut();
            replace_content(&mut txn, &root, &sample_tree());
        }
        {
            let mut txn = doc.transact_mut();
            replace_content(&mut txn, &root, &[Node::element("paragraph", vec![])]);
        }
        let txn = doc.transact();
        assert_eq!(
            read_children(&txn, &root),
            vec![Node::element("paragraph", vec![])]
        );
    }

    #[test]
    fn test_import_replicates_in_order() {
        let source = Doc::new();
        let root = source.get_or_insert_xml_fragment("content");
        {
            let mut txn = source.transact_mut();
            replace_content(&mut txn, &root, &sample_tree());
        }
        let update = source
            .transact()
            .encode_state_as_update_v1(&yrs::StateVector::default());

        let replica = Doc::new();
        let replica_root = replica.get_or_insert_xml_fragment("content");
        {
            use yrs::updates::decoder::Decode;
            let mut txn = replica.transact_mut();
            txn.apply_update(yrs::Update::decode_v1(&update).unwrap());
        }
        let txn = replica.transact();
        assert_eq!(
            normalize(&read_children(&txn, &replica_root)),
            normalize(&sample_tree())
        );
    }
}
