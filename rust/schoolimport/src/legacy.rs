use roxmltree::{Document, Node};
use std::collections::BTreeMap;

use crate::schema::line_of;

/// One record element from a legacy export, as untyped string fields.
#[derive(Clone, Debug, PartialEq)]
pub struct LegacyRecord {
    pub kind: String,
    pub line: u32,
    /// Zero-based index in document order across all sections.
    pub position: usize,
    fields: BTreeMap<String, String>,
}

impl LegacyRecord {
    pub fn new(kind: &str, line: u32, position: usize) -> Self {
        LegacyRecord {
            kind: kind.to_string(),
            line,
            position,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|s| s.as_str())
    }

    /// Key to report when mapping fails before a natural key is known.
    pub fn fallback_key(&self) -> String {
        for name in ["code", "name"] {
            if let Some(v) = self.get(name).map(str::trim).filter(|v| !v.is_empty()) {
                return v.to_string();
            }
        }
        format!("#{}", self.position + 1)
    }
}

/// Legacy exports are `<root><section><record>…</record></section></root>`.
/// Every element two levels below the root is a record, in document order.
pub fn read_records(doc: &Document) -> Vec<LegacyRecord> {
    let mut out = Vec::new();
    let root = doc.root_element();
    for section in root.children().filter(|n| n.is_element()) {
        for rec in section.children().filter(|n| n.is_element()) {
            let mut record = LegacyRecord::new(rec.tag_name().name(), line_of(rec), out.len());
            collect_fields(rec, "", &mut record.fields);
            out.push(record);
        }
    }
    out
}

fn collect_fields(node: Node, prefix: &str, fields: &mut BTreeMap<String, String>) {
    for attr in node.attributes() {
        if attr.namespace().is_some() {
            continue;
        }
        fields.insert(format!("{prefix}{}", attr.name()), attr.value().to_string());
    }
    for child in node.children().filter(|n| n.is_element()) {
        let name = format!("{prefix}{}", child.tag_name().name());
        if child.children().any(|n| n.is_element()) {
            collect_fields(child, &format!("{name}."), fields);
        } else {
            let text: String = child
                .children()
                .filter(|n| n.is_text())
                .filter_map(|n| n.text())
                .collect();
            fields.insert(name, text);
        }
    }
}
