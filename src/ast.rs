//! The syntax tree consumed by the lowering engine.
//!
//! Trees are produced by an external parser and handed over as JSON. Every node has a `kind`, an optional token
//! `text`, an optional literal `value`, and an ordered list of `children`. The kinds the lowering engine understands
//! and the children it expects are listed below (`[a, b?]` denotes the children, `{x}` denotes the token text).
//!
//! | Kind | Shape |
//! |---|---|
//! | `script` | `[directive or function...]` |
//! | `namespace` | `{name}` |
//! | `includes` | `{path}` |
//! | `globals` | `{name}` `[expr]`, a macro that expands to `expr` wherever `name` is referenced |
//! | `function` | `{name}` `[parameters, block, autoexec?, private?]` |
//! | `parameters` | `[parameter...]` |
//! | `parameter` | `{name}` `[default?]` |
//! | `block`, `blockContent`, `statement`, `statementBlock`, `declaration`, `parenExpr`, `empty` | `[child...]`, lowered in order |
//! | `ifStatement` | `[cond, then, else?]` |
//! | `conditionalStatement` | `[cond, then, else]` |
//! | `whileStatement` | `[cond, body]` |
//! | `forStatement` | `[init, cond, iter, body]`, with `empty` nodes for missing parts |
//! | `foreachSingle` | `[value, expr, body]` |
//! | `foreachDouble` | `[key, value, expr, body]` |
//! | `switchStatement` | `[scrutinee, (case or default)...]` |
//! | `case` | `[value, stmt...]` |
//! | `default` | `[stmt...]` |
//! | `jumpStatement` | `{break or continue}`, value: number of loops to leave (default 1) |
//! | `return` | `[expr?]` |
//! | `wait` | `[expr]` |
//! | `waitTillFrameEnd`, `newArray` | no children |
//! | `simpleCall` | `[call]`, a call whose result is discarded |
//! | `call` | `{name}` `[arguments?, namespace?, caller?, thread?, pointer?]` |
//! | `arguments` | `[expr...]` |
//! | `caller` | `[expr]`, the object a method is called on |
//! | `thread` | no children, marks a threaded call |
//! | `pointer` | `[expr]`, calls a function pointer instead of a named function |
//! | `setVariableField` | `{=, +=, ++, ??= ...}` `[target, value?]` |
//! | `shortHandArray` | `[expr...]`, only as the value of a `=` assignment |
//! | `directAccess`, `definedAccess` | `{field}` `[object]` (`a.b` and `a?.b`) |
//! | `array` | `[object, index]` |
//! | `booleanExpression` | `{&&, \|\|}` `[lhs, rhs]` |
//! | `relationalExpression`, `expression` | `{op}` `[lhs, rhs]` |
//! | `boolNot`, `size` | `[expr]` |
//! | `undefined_coalesce` | `[lhs, rhs]` |
//! | `typeComparison`, `typeComparisonInverted`, `castOp` | `{type}` `[expr]` |
//! | `identifier`, `stringLiteral`, `iString`, `debugString`, `hashedString`, `canonHashed` | `{text}` |
//! | `numberLiteral` | value: integer or float |
//! | `getFunction` | `{name}` `[namespace?]` |
//! | `vector` | `[x, y, z]` |
//!
//! Any other kind is rejected with [`CompileError::UnsupportedNode`].

use std::mem;

use compact_str::CompactString;
use serde::{Serialize, Deserialize};

use crate::*;

/// A literal value attached to a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Int(i64),
    Float(f64),
}

/// A single node of the syntax tree.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Node {
    pub kind: CompactString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<CompactString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Literal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,
}
impl Node {
    pub fn new(kind: &str, children: Vec<Node>) -> Self {
        Self { kind: kind.into(), text: None, value: None, children }
    }
    /// Creates a childless node with token text.
    pub fn token(kind: &str, text: &str) -> Self {
        Self { kind: kind.into(), text: Some(text.into()), value: None, children: vec![] }
    }
    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.into());
        self
    }
    pub fn with_value(mut self, value: Literal) -> Self {
        self.value = Some(value);
        self
    }

    /// Reads a tree from its JSON representation. Nesting depth is only limited by available memory.
    pub fn from_json(json: &str) -> Result<Self, CompileError> {
        let mut de = serde_json::Deserializer::from_str(json);
        de.disable_recursion_limit();
        let node = Node::deserialize(serde_stacker::Deserializer::new(&mut de))?;
        de.end()?;
        Ok(node)
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
    pub fn child(&self, index: usize) -> Result<&Node, CompileError> {
        self.children.get(index).ok_or_else(|| self.malformed("missing child"))
    }
    pub fn text(&self) -> Result<&str, CompileError> {
        self.text.as_deref().ok_or_else(|| self.malformed("missing token text"))
    }
    /// The first child of the given kind, if any.
    pub fn find_child(&self, kind: &str) -> Option<&Node> {
        self.children.iter().find(|x| x.is(kind))
    }
    pub(crate) fn malformed(&self, reason: &'static str) -> CompileError {
        CompileError::MalformedNode { kind: self.kind.clone(), reason }
    }
}
impl Drop for Node {
    fn drop(&mut self) {
        // flatten so that dropping a deep tree never recurses
        let mut pending = mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

#[test]
fn test_node_json() {
    let tree = Node::from_json(r#"{
        "kind": "setVariableField", "text": "=",
        "children": [
            { "kind": "identifier", "text": "x" },
            { "kind": "numberLiteral", "value": 12 },
            { "kind": "numberLiteral", "value": 1.5 }
        ]
    }"#).unwrap();
    assert!(tree.is("setVariableField"));
    assert_eq!(tree.text().unwrap(), "=");
    assert_eq!(tree.child(0).unwrap().text().unwrap(), "x");
    assert_eq!(tree.child(1).unwrap().value, Some(Literal::Int(12)));
    assert_eq!(tree.child(2).unwrap().value, Some(Literal::Float(1.5)));
    assert!(tree.find_child("numberLiteral").is_some());
    assert!(tree.find_child("call").is_none());
    assert!(matches!(tree.child(3), Err(CompileError::MalformedNode { reason: "missing child", .. })));
    assert!(matches!(tree.child(1).unwrap().text(), Err(CompileError::MalformedNode { reason: "missing token text", .. })));

    assert!(matches!(Node::from_json(r#"{ "text": "x" }"#), Err(CompileError::BadTree { .. })));
    assert!(matches!(Node::from_json("[]"), Err(CompileError::BadTree { .. })));
    assert!(matches!(Node::from_json(r#"{ "kind": "empty" } x"#), Err(CompileError::BadTree { .. })));
}

#[test]
fn test_node_json_deep() {
    let depth = 5000;
    let json = format!(r#"{}{{"kind":"numberLiteral","value":7}}{}"#, r#"{"kind":"parenExpr","children":["#.repeat(depth), "]}".repeat(depth));
    let mut node = &Node::from_json(&json).unwrap();
    for _ in 0..depth {
        assert!(node.is("parenExpr"));
        node = node.child(0).unwrap();
    }
    assert_eq!(node.value, Some(Literal::Int(7)));
}

#[test]
fn test_node_deep_drop() {
    let mut node = Node::token("identifier", "x");
    for _ in 0..100000 {
        node = Node::new("parenExpr", vec![node]);
    }
    drop(node);
}
