// Validation covers an XSD subset: global elements, complex and simple types,
// sequence/choice/all groups with occurrence bounds, references, attributes and
// enumeration/length facets. Anything else is rejected when the schema loads.
// Instance elements are matched on local names.

use chrono::NaiveDate;
use roxmltree::{Document, Node};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::error::SchemaError;

const XS_NS: &str = "http://www.w3.org/2001/XMLSchema";
const MAX_DEPTH: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub location: String,
    pub line: u32,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (line {}): {}", self.location, self.line, self.message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    String,
    NormalizedString,
    Token,
    Integer,
    NonNegativeInteger,
    PositiveInteger,
    Decimal,
    Boolean,
    Date,
}

impl Builtin {
    fn from_local(name: &str) -> Option<Builtin> {
        Some(match name {
            "string" | "anyURI" => Builtin::String,
            "normalizedString" => Builtin::NormalizedString,
            "token" => Builtin::Token,
            "integer" | "int" | "long" | "short" => Builtin::Integer,
            "nonNegativeInteger" => Builtin::NonNegativeInteger,
            "positiveInteger" => Builtin::PositiveInteger,
            "decimal" | "double" | "float" => Builtin::Decimal,
            "boolean" => Builtin::Boolean,
            "date" => Builtin::Date,
            _ => return None,
        })
    }

    fn xs_name(self) -> &'static str {
        match self {
            Builtin::String => "xs:string",
            Builtin::NormalizedString => "xs:normalizedString",
            Builtin::Token => "xs:token",
            Builtin::Integer => "xs:integer",
            Builtin::NonNegativeInteger => "xs:nonNegativeInteger",
            Builtin::PositiveInteger => "xs:positiveInteger",
            Builtin::Decimal => "xs:decimal",
            Builtin::Boolean => "xs:boolean",
            Builtin::Date => "xs:date",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimpleType {
    base: Builtin,
    enumeration: Vec<String>,
    min_length: Option<usize>,
    max_length: Option<usize>,
}

impl SimpleType {
    fn builtin(base: Builtin) -> Self {
        SimpleType {
            base,
            enumeration: Vec::new(),
            min_length: None,
            max_length: None,
        }
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        let value = match self.base {
            Builtin::String => raw,
            _ => raw.trim(),
        };
        let ok = match self.base {
            Builtin::String | Builtin::NormalizedString | Builtin::Token => true,
            Builtin::Integer => parse_integer(value).is_some(),
            Builtin::NonNegativeInteger => parse_integer(value).is_some_and(|n| n >= 0),
            Builtin::PositiveInteger => parse_integer(value).is_some_and(|n| n > 0),
            Builtin::Decimal => is_decimal(value),
            Builtin::Boolean => matches!(value, "true" | "false" | "1" | "0"),
            Builtin::Date => NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok(),
        };
        if !ok {
            return Err(format!(
                "value '{}' is not a valid {}",
                value,
                self.base.xs_name()
            ));
        }
        if !self.enumeration.is_empty() && !self.enumeration.iter().any(|e| e == value) {
            return Err(format!(
                "value '{}' is not one of [{}]",
                value,
                self.enumeration.join(", ")
            ));
        }
        let len = value.chars().count();
        if let Some(min) = self.min_length {
            if len < min {
                return Err(format!("value '{value}' is shorter than {min} characters"));
            }
        }
        if let Some(max) = self.max_length {
            if len > max {
                return Err(format!("value '{value}' is longer than {max} characters"));
            }
        }
        Ok(())
    }
}

fn parse_integer(s: &str) -> Option<i64> {
    s.strip_prefix('+').unwrap_or(s).parse::<i64>().ok()
}

fn is_decimal(s: &str) -> bool {
    let digits = s
        .strip_prefix('-')
        .or_else(|| s.strip_prefix('+'))
        .unwrap_or(s);
    let mut seen_digit = false;
    let mut seen_dot = false;
    for ch in digits.chars() {
        match ch {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return false,
        }
    }
    seen_digit
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Compositor {
    Sequence,
    Choice,
    All,
}

#[derive(Clone, Debug)]
struct ElementDecl {
    name: String,
    min: u32,
    max: Option<u32>,
    content: Content,
}

#[derive(Clone, Debug)]
enum Content {
    Simple(SimpleType),
    /// Index into `Schema::complex`.
    Complex(usize),
}

#[derive(Clone, Debug)]
struct AttributeDecl {
    name: String,
    required: bool,
    ty: SimpleType,
}

#[derive(Clone, Debug)]
struct Group {
    compositor: Compositor,
    min: u32,
    max: Option<u32>,
    particles: Vec<ElementDecl>,
}

#[derive(Clone, Debug, Default)]
struct ComplexType {
    mixed: bool,
    group: Option<Group>,
    attributes: Vec<AttributeDecl>,
}

/// A loaded schema. Immutable once built.
#[derive(Clone, Debug)]
pub struct Schema {
    globals: Vec<ElementDecl>,
    complex: Vec<ComplexType>,
}

impl Schema {
    pub fn parse(text: &str) -> Result<Schema, SchemaError> {
        let doc = Document::parse(text)?;
        let root = doc.root_element();
        if !is_xs(root, "schema") {
            return Err(SchemaError::NotASchema(root.tag_name().name().to_string()));
        }

        let mut builder = Builder {
            globals: HashMap::new(),
            complex_nodes: HashMap::new(),
            simple_nodes: HashMap::new(),
            complex: Vec::new(),
            complex_index: HashMap::new(),
        };
        let mut global_order = Vec::new();
        for child in xs_children(root) {
            let local = child.tag_name().name();
            match local {
                "annotation" => {}
                "element" | "complexType" | "simpleType" => {
                    let name = child
                        .attribute("name")
                        .ok_or(SchemaError::Unnamed { line: line_of(child) })?;
                    match local {
                        "element" => {
                            builder.globals.insert(name, child);
                            global_order.push(child);
                        }
                        "complexType" => {
                            builder.complex_nodes.insert(name, child);
                        }
                        _ => {
                            builder.simple_nodes.insert(name, child);
                        }
                    }
                }
                _ => return Err(unsupported(child)),
            }
        }
        if global_order.is_empty() {
            return Err(SchemaError::NoGlobalElement);
        }

        let mut globals = Vec::with_capacity(global_order.len());
        for node in global_order {
            globals.push(builder.element(node, 0)?);
        }
        Ok(Schema {
            globals,
            complex: builder.complex,
        })
    }

    /// Check a whole document. Every violation is collected; the result is
    /// never a partial verdict.
    pub fn validate(&self, doc: &Document) -> Result<(), Vec<Violation>> {
        let mut violations = Vec::new();
        let root = doc.root_element();
        let name = root.tag_name().name();
        match self.globals.iter().find(|g| g.name == name) {
            Some(decl) => self.check_element(root, decl, format!("/{name}"), &mut violations),
            None => violations.push(Violation {
                location: format!("/{name}"),
                line: line_of(root),
                message: format!("root element <{name}> is not declared by the schema"),
            }),
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    fn check_element(&self, node: Node, decl: &ElementDecl, path: String, out: &mut Vec<Violation>) {
        let attrs: &[AttributeDecl] = match &decl.content {
            Content::Complex(idx) => &self.complex[*idx].attributes,
            Content::Simple(_) => &[],
        };
        check_attributes(node, attrs, &path, out);

        match &decl.content {
            Content::Simple(ty) => {
                if let Some(child) = node.children().find(|c| c.is_element()) {
                    out.push(Violation {
                        location: path.clone(),
                        line: line_of(child),
                        message: format!(
                            "element <{}> does not allow child element <{}>",
                            decl.name,
                            child.tag_name().name()
                        ),
                    });
                    return;
                }
                let text: String = node
                    .children()
                    .filter(|c| c.is_text())
                    .filter_map(|c| c.text())
                    .collect();
                if let Err(message) = ty.check(&text) {
                    out.push(Violation {
                        location: path,
                        line: line_of(node),
                        message,
                    });
                }
            }
            Content::Complex(idx) => {
                let ct = &self.complex[*idx];
                if !ct.mixed {
                    if let Some(t) = node
                        .children()
                        .find(|c| c.is_text() && c.text().is_some_and(|s| !s.trim().is_empty()))
                    {
                        out.push(Violation {
                            location: path.clone(),
                            line: line_of(t),
                            message: format!("element <{}> does not allow text content", decl.name),
                        });
                    }
                }
                let children: Vec<Node> = node.children().filter(|c| c.is_element()).collect();
                match &ct.group {
                    None => {
                        for child in &children {
                            out.push(unexpected(*child, &path));
                        }
                    }
                    Some(group) => self.check_group(node, &children, group, &path, out),
                }
            }
        }
    }

    fn check_group(
        &self,
        parent: Node,
        children: &[Node],
        group: &Group,
        path: &str,
        out: &mut Vec<Violation>,
    ) {
        if children.is_empty() && group.min == 0 {
            return;
        }
        // Positional predicates only when a name repeats among siblings.
        let mut totals: HashMap<String, usize> = HashMap::new();
        for child in children {
            *totals.entry(child.tag_name().name().to_string()).or_insert(0) += 1;
        }
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut child_path = |child: Node| -> String {
            let name = child.tag_name().name().to_string();
            let n = seen.entry(name.clone()).or_insert(0);
            *n += 1;
            if totals.get(&name).copied().unwrap_or(0) > 1 {
                format!("{path}/{name}[{n}]")
            } else {
                format!("{path}/{name}")
            }
        };

        match group.compositor {
            Compositor::Sequence => {
                let mut pos = 0usize;
                for particle in &group.particles {
                    let mut count = 0u32;
                    while pos < children.len()
                        && children[pos].tag_name().name() == particle.name
                        && particle.max.map_or(true, |m| count < m)
                    {
                        let p = child_path(children[pos]);
                        self.check_element(children[pos], particle, p, out);
                        count += 1;
                        pos += 1;
                    }
                    if count < particle.min {
                        out.push(missing(parent, path, &particle.name));
                    }
                }
                for child in &children[pos..] {
                    out.push(unexpected(*child, path));
                }
            }
            Compositor::Choice => {
                let mut reps = 0u32;
                for child in children {
                    let name = child.tag_name().name();
                    match group.particles.iter().find(|p| p.name == name) {
                        Some(particle) => {
                            reps += 1;
                            let p = child_path(*child);
                            self.check_element(*child, particle, p, out);
                        }
                        None => out.push(unexpected(*child, path)),
                    }
                }
                if reps < group.min {
                    let names: Vec<&str> = group.particles.iter().map(|p| p.name.as_str()).collect();
                    out.push(Violation {
                        location: path.to_string(),
                        line: line_of(parent),
                        message: format!(
                            "expected at least {} of <{}>",
                            group.min,
                            names.join("|")
                        ),
                    });
                }
                if let Some(max) = group.max {
                    if reps > max {
                        out.push(Violation {
                            location: path.to_string(),
                            line: line_of(parent),
                            message: format!("expected at most {max} child elements, found {reps}"),
                        });
                    }
                }
            }
            Compositor::All => {
                let mut counts: HashMap<&str, u32> = HashMap::new();
                for child in children {
                    let name = child.tag_name().name();
                    match group.particles.iter().find(|p| p.name == name) {
                        Some(particle) => {
                            let c = counts.entry(particle.name.as_str()).or_insert(0);
                            *c += 1;
                            if *c > 1 {
                                out.push(Violation {
                                    location: path.to_string(),
                                    line: line_of(*child),
                                    message: format!("element <{name}> may appear at most once"),
                                });
                                continue;
                            }
                            let p = child_path(*child);
                            self.check_element(*child, particle, p, out);
                        }
                        None => out.push(unexpected(*child, path)),
                    }
                }
                for particle in &group.particles {
                    if particle.min > 0 && !counts.contains_key(particle.name.as_str()) {
                        out.push(missing(parent, path, &particle.name));
                    }
                }
            }
        }
    }
}

fn check_attributes(node: Node, decls: &[AttributeDecl], path: &str, out: &mut Vec<Violation>) {
    for attr in node.attributes() {
        // xsi:* and other qualified attributes are outside the content model.
        if attr.namespace().is_some() {
            continue;
        }
        match decls.iter().find(|d| d.name == attr.name()) {
            Some(decl) => {
                if let Err(message) = decl.ty.check(attr.value()) {
                    out.push(Violation {
                        location: format!("{path}/@{}", attr.name()),
                        line: line_of(node),
                        message,
                    });
                }
            }
            None => out.push(Violation {
                location: format!("{path}/@{}", attr.name()),
                line: line_of(node),
                message: format!("unexpected attribute '{}'", attr.name()),
            }),
        }
    }
    for decl in decls.iter().filter(|d| d.required) {
        if node.attribute(decl.name.as_str()).is_none() {
            out.push(Violation {
                location: path.to_string(),
                line: line_of(node),
                message: format!("missing required attribute '{}'", decl.name),
            });
        }
    }
}

fn missing(parent: Node, path: &str, name: &str) -> Violation {
    Violation {
        location: path.to_string(),
        line: line_of(parent),
        message: format!("missing required element <{name}>"),
    }
}

fn unexpected(child: Node, path: &str) -> Violation {
    let name = child.tag_name().name();
    Violation {
        location: format!("{path}/{name}"),
        line: line_of(child),
        message: format!("unexpected element <{name}>"),
    }
}

struct Builder<'a, 'input: 'a> {
    globals: HashMap<&'a str, Node<'a, 'input>>,
    complex_nodes: HashMap<&'a str, Node<'a, 'input>>,
    simple_nodes: HashMap<&'a str, Node<'a, 'input>>,
    complex: Vec<ComplexType>,
    complex_index: HashMap<String, usize>,
}

impl<'a, 'input: 'a> Builder<'a, 'input> {
    fn element(&mut self, node: Node<'a, 'input>, depth: usize) -> Result<ElementDecl, SchemaError> {
        if depth > MAX_DEPTH {
            return Err(SchemaError::Unsupported {
                construct: "element (nesting too deep or recursive)".into(),
                line: line_of(node),
            });
        }
        let (min, max) = occurs(node)?;

        if let Some(reference) = node.attribute("ref") {
            let (_, local) = resolve_qname(node, reference);
            let target = *self
                .globals
                .get(local)
                .ok_or_else(|| SchemaError::UnknownElement {
                    name: reference.to_string(),
                    line: line_of(node),
                })?;
            let mut decl = self.element(target, depth + 1)?;
            decl.min = min;
            decl.max = max;
            return Ok(decl);
        }

        let name = node
            .attribute("name")
            .ok_or(SchemaError::Unnamed { line: line_of(node) })?
            .to_string();

        let content = if let Some(type_name) = node.attribute("type") {
            self.type_ref(node, type_name, depth)?
        } else if let Some(ct) = xs_children(node).find(|c| is_xs(*c, "complexType")) {
            let ct = self.complex_type(ct, depth)?;
            self.complex.push(ct);
            Content::Complex(self.complex.len() - 1)
        } else if let Some(st) = xs_children(node).find(|c| is_xs(*c, "simpleType")) {
            Content::Simple(self.simple_type(st, depth)?)
        } else {
            Content::Simple(SimpleType::builtin(Builtin::String))
        };

        Ok(ElementDecl {
            name,
            min,
            max,
            content,
        })
    }

    fn type_ref(
        &mut self,
        node: Node<'a, 'input>,
        type_name: &str,
        depth: usize,
    ) -> Result<Content, SchemaError> {
        let (is_builtin_ns, local) = resolve_qname(node, type_name);
        if is_builtin_ns {
            return Builtin::from_local(local)
                .map(|b| Content::Simple(SimpleType::builtin(b)))
                .ok_or_else(|| SchemaError::UnknownType {
                    name: type_name.to_string(),
                    line: line_of(node),
                });
        }
        if let Some(st) = self.simple_nodes.get(local).copied() {
            return Ok(Content::Simple(self.simple_type(st, depth + 1)?));
        }
        if let Some(idx) = self.complex_index.get(local) {
            return Ok(Content::Complex(*idx));
        }
        if let Some(ct_node) = self.complex_nodes.get(local).copied() {
            // Reserve the slot first so recursive references resolve to it.
            let idx = self.complex.len();
            self.complex.push(ComplexType::default());
            self.complex_index.insert(local.to_string(), idx);
            let ct = self.complex_type(ct_node, depth + 1)?;
            self.complex[idx] = ct;
            return Ok(Content::Complex(idx));
        }
        Err(SchemaError::UnknownType {
            name: type_name.to_string(),
            line: line_of(node),
        })
    }

    fn complex_type(&mut self, node: Node<'a, 'input>, depth: usize) -> Result<ComplexType, SchemaError> {
        let mixed = parse_bool_attr(node, "mixed")?;
        let mut ct = ComplexType {
            mixed,
            ..ComplexType::default()
        };
        for child in xs_children(node) {
            match child.tag_name().name() {
                "annotation" => {}
                "sequence" | "choice" | "all" => {
                    if ct.group.is_some() {
                        return Err(unsupported(child));
                    }
                    ct.group = Some(self.group(child, depth)?);
                }
                "attribute" => ct.attributes.push(self.attribute(child, depth)?),
                _ => return Err(unsupported(child)),
            }
        }
        Ok(ct)
    }

    fn group(&mut self, node: Node<'a, 'input>, depth: usize) -> Result<Group, SchemaError> {
        let compositor = match node.tag_name().name() {
            "sequence" => Compositor::Sequence,
            "choice" => Compositor::Choice,
            _ => Compositor::All,
        };
        let (min, max) = occurs(node)?;
        // Repeated sequences and alls would need backtracking; choice covers
        // the repeated-record shape legacy exports use.
        if compositor != Compositor::Choice && max != Some(1) {
            return Err(SchemaError::Unsupported {
                construct: format!("{} with maxOccurs other than 1", node.tag_name().name()),
                line: line_of(node),
            });
        }
        let mut particles = Vec::new();
        for child in xs_children(node) {
            match child.tag_name().name() {
                "annotation" => {}
                "element" => particles.push(self.element(child, depth + 1)?),
                _ => return Err(unsupported(child)),
            }
        }
        Ok(Group {
            compositor,
            min,
            max,
            particles,
        })
    }

    fn attribute(&mut self, node: Node<'a, 'input>, depth: usize) -> Result<AttributeDecl, SchemaError> {
        let name = node
            .attribute("name")
            .ok_or(SchemaError::Unnamed { line: line_of(node) })?
            .to_string();
        let required = match node.attribute("use") {
            None | Some("optional") => false,
            Some("required") => true,
            Some(other) => {
                return Err(SchemaError::BadAttribute {
                    attribute: "use".into(),
                    value: other.into(),
                    line: line_of(node),
                })
            }
        };
        let ty = if let Some(type_name) = node.attribute("type") {
            match self.type_ref(node, type_name, depth)? {
                Content::Simple(st) => st,
                Content::Complex(_) => {
                    return Err(SchemaError::UnknownType {
                        name: type_name.to_string(),
                        line: line_of(node),
                    })
                }
            }
        } else if let Some(st) = xs_children(node).find(|c| is_xs(*c, "simpleType")) {
            self.simple_type(st, depth)?
        } else {
            SimpleType::builtin(Builtin::String)
        };
        Ok(AttributeDecl { name, required, ty })
    }

    fn simple_type(&mut self, node: Node<'a, 'input>, depth: usize) -> Result<SimpleType, SchemaError> {
        if depth > MAX_DEPTH {
            return Err(unsupported(node));
        }
        let restriction = xs_children(node)
            .find(|c| c.tag_name().name() != "annotation")
            .ok_or_else(|| unsupported(node))?;
        if restriction.tag_name().name() != "restriction" {
            return Err(unsupported(restriction));
        }
        let base_name = restriction.attribute("base").ok_or(SchemaError::BadAttribute {
            attribute: "base".into(),
            value: String::new(),
            line: line_of(restriction),
        })?;
        let mut ty = match self.type_ref(restriction, base_name, depth)? {
            Content::Simple(st) => st,
            Content::Complex(_) => {
                return Err(SchemaError::UnknownType {
                    name: base_name.to_string(),
                    line: line_of(restriction),
                })
            }
        };

        let mut enumeration = Vec::new();
        for facet in xs_children(restriction) {
            let value = facet.attribute("value").unwrap_or("");
            match facet.tag_name().name() {
                "annotation" => {}
                "enumeration" => enumeration.push(value.to_string()),
                "minLength" => ty.min_length = Some(parse_usize(facet, value)?),
                "maxLength" => ty.max_length = Some(parse_usize(facet, value)?),
                "length" => {
                    let n = parse_usize(facet, value)?;
                    ty.min_length = Some(n);
                    ty.max_length = Some(n);
                }
                _ => return Err(unsupported(facet)),
            }
        }
        if !enumeration.is_empty() {
            ty.enumeration = enumeration;
        }
        Ok(ty)
    }
}

fn is_xs(node: Node, local: &str) -> bool {
    node.is_element() && node.tag_name().namespace() == Some(XS_NS) && node.tag_name().name() == local
}

fn xs_children<'a, 'input: 'a>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(|c| c.is_element() && c.tag_name().namespace() == Some(XS_NS))
}

/// Splits a QName and reports whether its prefix maps to the XSD namespace.
fn resolve_qname<'q>(node: Node, qname: &'q str) -> (bool, &'q str) {
    let (prefix, local) = match qname.split_once(':') {
        Some((p, l)) => (Some(p), l),
        None => (None, qname),
    };
    (node.lookup_namespace_uri(prefix) == Some(XS_NS), local)
}

fn occurs(node: Node) -> Result<(u32, Option<u32>), SchemaError> {
    let parse = |attr: &str| -> Result<Option<u32>, SchemaError> {
        match node.attribute(attr) {
            None => Ok(Some(1)),
            Some("unbounded") if attr == "maxOccurs" => Ok(None),
            Some(v) => v.trim().parse::<u32>().map(Some).map_err(|_| SchemaError::BadAttribute {
                attribute: attr.to_string(),
                value: v.to_string(),
                line: line_of(node),
            }),
        }
    };
    let min = parse("minOccurs")?.unwrap_or(1);
    let max = parse("maxOccurs")?;
    Ok((min, max))
}

fn parse_bool_attr(node: Node, attr: &str) -> Result<bool, SchemaError> {
    match node.attribute(attr) {
        None | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(other) => Err(SchemaError::BadAttribute {
            attribute: attr.to_string(),
            value: other.to_string(),
            line: line_of(node),
        }),
    }
}

fn parse_usize(node: Node, value: &str) -> Result<usize, SchemaError> {
    value.trim().parse::<usize>().map_err(|_| SchemaError::BadAttribute {
        attribute: node.tag_name().name().to_string(),
        value: value.to_string(),
        line: line_of(node),
    })
}

fn unsupported(node: Node) -> SchemaError {
    SchemaError::Unsupported {
        construct: node.tag_name().name().to_string(),
        line: line_of(node),
    }
}

pub(crate) fn line_of(node: Node) -> u32 {
    node.document().text_pos_at(node.range().start).row
}
