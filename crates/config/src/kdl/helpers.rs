//! Accessors for KDL nodes.
//!
//! Configuration blocks are written as a parent node whose children carry one
//! setting each, e.g. `listen "0.0.0.0:8000"`. The helpers below look up a
//! child by name and read its positional arguments.

use ::kdl::{KdlDocument, KdlNode, KdlValue};

/// Find a top-level node by name.
pub fn find_node<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlNode> {
    doc.nodes().iter().find(|n| n.name().value() == name)
}

/// Find a child node of a block by name.
pub fn find_child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|n| n.name().value() == name)
}

/// Iterate over all children of a block with the given name.
pub fn children_named<'a>(node: &'a KdlNode, name: &'a str) -> impl Iterator<Item = &'a KdlNode> {
    node.children()
        .map(|doc| doc.nodes())
        .unwrap_or(&[])
        .iter()
        .filter(move |n| n.name().value() == name)
}

/// Positional (unnamed) argument values of a node.
pub fn args(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

/// First positional argument as a string.
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    args(node).next().and_then(value_as_string)
}

/// All positional string arguments of a node.
pub fn get_string_args(node: &KdlNode) -> Vec<String> {
    args(node).filter_map(value_as_string).collect()
}

/// String value of the child `name`.
pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    find_child(node, name).and_then(get_first_arg_string)
}

/// Integer value of the child `name`.
pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    find_child(node, name)
        .and_then(|child| args(child).next())
        .and_then(|value| match value {
            KdlValue::Integer(i) => Some(*i),
            _ => None,
        })
}

/// Boolean value of the child `name`.
pub fn get_bool_entry(node: &KdlNode, name: &str) -> Option<bool> {
    find_child(node, name)
        .and_then(|child| args(child).next())
        .and_then(|value| match value {
            KdlValue::Bool(b) => Some(*b),
            _ => None,
        })
}

/// Non-negative integer value of the child `name`, rejecting negatives and
/// values that do not fit in `u64`.
pub fn get_u64_entry(node: &KdlNode, name: &str) -> anyhow::Result<Option<u64>> {
    match get_int_entry(node, name) {
        None => Ok(None),
        Some(v) => u64::try_from(v)
            .map(Some)
            .map_err(|_| anyhow::anyhow!("'{}' must be a non-negative integer, got {}", name, v)),
    }
}

fn value_as_string(value: &KdlValue) -> Option<String> {
    match value {
        KdlValue::String(s) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> KdlDocument {
        text.parse().unwrap()
    }

    #[test]
    fn test_entries() {
        let d = doc(
            r#"
            block {
                name "value"
                count 42
                enabled #true
                items "a" "b" "c"
                negative -1
            }
            "#,
        );
        let block = find_node(&d, "block").unwrap();

        assert_eq!(get_string_entry(block, "name"), Some("value".to_string()));
        assert_eq!(get_int_entry(block, "count"), Some(42));
        assert_eq!(get_bool_entry(block, "enabled"), Some(true));
        assert_eq!(
            get_string_args(find_child(block, "items").unwrap()),
            vec!["a", "b", "c"]
        );
        assert_eq!(get_u64_entry(block, "count").unwrap(), Some(42));
        assert!(get_u64_entry(block, "negative").is_err());
        assert_eq!(get_string_entry(block, "missing"), None);
        // Wrong type reads as absent
        assert_eq!(get_int_entry(block, "name"), None);
    }

    #[test]
    fn test_children_named() {
        let d = doc(
            r#"
            whitelist {
                domain "a.example.com"
                domain "b.example.com"
                other "x"
            }
            "#,
        );
        let block = find_node(&d, "whitelist").unwrap();
        let domains: Vec<_> = children_named(block, "domain")
            .filter_map(get_first_arg_string)
            .collect();
        assert_eq!(domains, vec!["a.example.com", "b.example.com"]);
    }
}
