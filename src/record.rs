//! Folding of parsed S-expressions into key-addressable records.
//!
//! The fold is arity-driven and schema-free: a one-element list folds to its
//! element, a two-element list `(k v)` to `{k: v}`, and a longer list
//! `(k v1 v2 ...)` to `{k: [v1, v2, ...]}`. The first element must be a
//! token. Because a single child and a list of children fold differently,
//! callers that know their schema should use `Record::children` and the
//! name-based lookups below instead of relying on positions.

use crate::sexp::Value;
use crate::KeyTrustError;

/// A folded S-expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Atom(Value),
    Record(Record),
}

/// The value side of a record: one child or an ordered sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    One(Box<Node>),
    Many(Vec<Node>),
}

/// A single-key mapping produced by folding `(key ...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    pub field: Field,
}

impl Field {
    fn take_nodes(&mut self) -> Vec<Node> {
        match self {
            Field::One(node) => vec![std::mem::replace(
                &mut **node,
                Node::Atom(Value::List(Vec::new())),
            )],
            Field::Many(nodes) => std::mem::take(nodes),
        }
    }
}

/// Releases nested records from a work stack so that dropping a deep tree
/// does not recurse.
impl Drop for Field {
    fn drop(&mut self) {
        let mut pending = self.take_nodes();
        while let Some(mut node) = pending.pop() {
            if let Node::Record(record) = &mut node {
                pending.append(&mut record.field.take_nodes());
            }
        }
    }
}

impl Node {
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Node::Record(r) => Some(r),
            Node::Atom(_) => None,
        }
    }

    pub fn as_atom(&self) -> Option<&Value> {
        match self {
            Node::Atom(v) => Some(v),
            Node::Record(_) => None,
        }
    }
}

impl Record {
    /// Fold `value` and require the result to be a record.
    pub fn from_value(value: &Value) -> Result<Record, KeyTrustError> {
        match normalize(value)? {
            Node::Record(r) => Ok(r),
            Node::Atom(v) => Err(KeyTrustError::Schema(format!(
                "expected a (key ...) list, found atom {}",
                v
            ))),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Children of the record regardless of how many there are.
    pub fn children(&self) -> &[Node] {
        match &self.field {
            Field::One(node) => std::slice::from_ref(&**node),
            Field::Many(nodes) => nodes,
        }
    }

    /// Child records whose key is `name`, in order.
    pub fn entries<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Record> + 'a {
        self.children()
            .iter()
            .filter_map(Node::as_record)
            .filter(move |r| r.key == name)
    }

    /// The first child record named `name`.
    pub fn entry(&self, name: &str) -> Result<&Record, KeyTrustError> {
        self.children()
            .iter()
            .filter_map(Node::as_record)
            .find(|r| r.key == name)
            .ok_or_else(|| {
                KeyTrustError::Schema(format!("'{}' has no '{}' field", self.key, name))
            })
    }

    /// The single value of the child record named `name`.
    pub fn value(&self, name: &str) -> Result<&Node, KeyTrustError> {
        match &self.entry(name)?.field {
            Field::One(node) => Ok(&**node),
            Field::Many(nodes) => Err(KeyTrustError::Schema(format!(
                "'{}' field '{}' has {} values, expected one",
                self.key,
                name,
                nodes.len()
            ))),
        }
    }

    /// The single atom value of the child record named `name`.
    pub fn atom(&self, name: &str) -> Result<&Value, KeyTrustError> {
        self.value(name)?.as_atom().ok_or_else(|| {
            KeyTrustError::Schema(format!("'{}' field '{}' is not an atom", self.key, name))
        })
    }

    /// The atom value of `name` read as text (a token or UTF-8 bytes).
    pub fn text(&self, name: &str) -> Result<String, KeyTrustError> {
        match self.atom(name)? {
            Value::Token(t) => Ok(t.clone()),
            Value::Bytes(b) => String::from_utf8(b.clone()).map_err(|_| {
                KeyTrustError::Schema(format!("'{}' field '{}' is not UTF-8", self.key, name))
            }),
            other => Err(KeyTrustError::Schema(format!(
                "'{}' field '{}' is not text: {}",
                self.key, name, other
            ))),
        }
    }
}

/// Fold a parsed tree into a `Node`.
///
/// Atoms fold to themselves. The fold keeps its own work stack, so any
/// tree the parser accepts can be folded.
///
/// # Errors
/// Returns `KeyTrustError::Schema` for an empty list or a list whose first
/// element is not a token.
pub fn normalize(value: &Value) -> Result<Node, KeyTrustError> {
    let mut open: Vec<Pending<'_>> = Vec::new();
    let mut next = value;
    loop {
        let mut node = match step(next)? {
            Step::Leaf(node) => node,
            Step::Open(pending, first) => {
                open.push(pending);
                next = first;
                continue;
            }
        };
        loop {
            let Some(mut top) = open.pop() else {
                return Ok(node);
            };
            top.done.push(node);
            if let Some(value) = top.rest.next() {
                open.push(top);
                next = value;
                break;
            }
            node = top.finish();
        }
    }
}

/// A record whose children are still being folded.
struct Pending<'v> {
    key: String,
    rest: std::slice::Iter<'v, Value>,
    done: Vec<Node>,
}

impl Pending<'_> {
    fn finish(self) -> Node {
        let Pending { key, mut done, .. } = self;
        let field = if done.len() == 1 {
            Field::One(Box::new(done.swap_remove(0)))
        } else {
            Field::Many(done)
        };
        Node::Record(Record { key, field })
    }
}

enum Step<'v> {
    Leaf(Node),
    Open(Pending<'v>, &'v Value),
}

/// Fold as far as the next child that needs its own record.
fn step(mut value: &Value) -> Result<Step<'_>, KeyTrustError> {
    loop {
        let items = match value {
            Value::List(items) => items,
            atom => return Ok(Step::Leaf(Node::Atom(atom.clone()))),
        };
        match items.as_slice() {
            [] => return Err(KeyTrustError::Schema("cannot fold an empty list".to_string())),
            [only] => value = only,
            [head, first, rest @ ..] => {
                let key = head
                    .as_token()
                    .ok_or_else(|| {
                        KeyTrustError::Schema(format!("record key must be a token, found {}", head))
                    })?
                    .to_string();
                let pending = Pending {
                    key,
                    rest: rest.iter(),
                    done: Vec::with_capacity(rest.len() + 1),
                };
                return Ok(Step::Open(pending, first));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexp::parse;

    fn token(s: &str) -> Value {
        Value::Token(s.to_string())
    }

    #[test]
    fn test_fold_flat_list() {
        let node = normalize(&parse("(a b c)").unwrap()).unwrap();
        assert_eq!(
            node,
            Node::Record(Record {
                key: "a".to_string(),
                field: Field::Many(vec![Node::Atom(token("b")), Node::Atom(token("c"))]),
            })
        );
    }

    #[test]
    fn test_fold_pair_and_singleton() {
        let node = normalize(&parse("((name bob))").unwrap()).unwrap();
        let record = node.as_record().unwrap();
        assert_eq!(record.key(), "name");
        assert_eq!(record.field, Field::One(Box::new(Node::Atom(token("bob")))));
    }

    #[test]
    fn test_fold_atom() {
        assert_eq!(normalize(&token("x")).unwrap(), Node::Atom(token("x")));
    }

    #[test]
    fn test_fold_requires_token_key() {
        let err = normalize(&parse(r#"("a" b)"#).unwrap()).unwrap_err();
        assert!(matches!(err, KeyTrustError::Schema(_)));
        assert!(normalize(&parse("()").unwrap()).is_err());
    }

    #[test]
    fn test_lookup_by_name() {
        let record =
            Record::from_value(&parse(r#"(account (name "bob@example.org") (protocol prpl-jabber))"#).unwrap())
                .unwrap();
        assert_eq!(record.text("name").unwrap(), "bob@example.org");
        assert_eq!(record.text("protocol").unwrap(), "prpl-jabber");
        assert!(record.entry("private-key").is_err());
    }

    #[test]
    fn test_entry_outlives_name() {
        let record = Record::from_value(&parse("(account (name bob) (protocol irc))").unwrap()).unwrap();
        let found = {
            let name = String::from("protocol");
            record.entry(&name).unwrap()
        };
        assert_eq!(found.key(), "protocol");
    }

    #[test]
    fn test_children_uniform_over_arity() {
        let one = Record::from_value(&parse("(list (item 1))").unwrap()).unwrap();
        let many = Record::from_value(&parse("(list (item 1) (item 2))").unwrap()).unwrap();
        assert_eq!(one.entries("item").count(), 1);
        assert_eq!(many.entries("item").count(), 2);
    }

    #[test]
    fn test_fold_deep_nesting() {
        let depth = 100_000;
        let source = format!("{}leaf{}", "(r ".repeat(depth), ")".repeat(depth));
        let value = parse(&source).unwrap();
        let node = normalize(&value).unwrap();
        let mut record = node.as_record().unwrap();
        let mut seen = 1;
        while let Some(inner) = record.children().first().and_then(Node::as_record) {
            record = inner;
            seen += 1;
        }
        assert_eq!(seen, depth);
        assert_eq!(record.field, Field::One(Box::new(Node::Atom(token("leaf")))));
    }

    #[test]
    fn test_fold_deep_singletons() {
        let depth = 100_000;
        let source = format!("{}x{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(normalize(&parse(&source).unwrap()).unwrap(), Node::Atom(token("x")));
    }

    #[test]
    fn test_value_rejects_many() {
        let record = Record::from_value(&parse("(r (f 1 2))").unwrap()).unwrap();
        assert!(matches!(record.value("f").unwrap_err(), KeyTrustError::Schema(_)));
    }
}
