//! A small hand-authored stand-in for "the schema representation" that
//! `register_message` (see `registry::Registry::register_message`) reflects
//! over. The real schema representation — message and field definitions
//! parsed from a `.proto` file — is named in the crate's scope as an
//! external collaborator this crate does not own. This module exists only so
//! reflection-based registration has something concrete to traverse in tests
//! and examples.
//!
//! `Rc` (not `Box`) links `FieldDef` to its submessage `MessageDef` so a
//! schema graph can express cycles (`message Node { Node child = 1; }`) and
//! diamonds (two fields pointing at the same nested message), which
//! `register_message`'s cycle-breaking DFS is specifically built to handle.

use std::rc::Rc;

use crate::wire::FieldType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(FieldType),
    Message(Rc<MessageDef>),
    Group(Rc<MessageDef>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDef {
    pub number: u32,
    pub name: String,
    pub kind: FieldKind,
    pub repeated: bool,
}

impl FieldDef {
    pub fn scalar(number: u32, name: impl Into<String>, field_type: FieldType, repeated: bool) -> Self {
        Self {
            number,
            name: name.into(),
            kind: FieldKind::Scalar(field_type),
            repeated,
        }
    }

    pub fn message(number: u32, name: impl Into<String>, submsg: Rc<MessageDef>, repeated: bool) -> Self {
        Self {
            number,
            name: name.into(),
            kind: FieldKind::Message(submsg),
            repeated,
        }
    }

    pub fn group(number: u32, name: impl Into<String>, submsg: Rc<MessageDef>, repeated: bool) -> Self {
        Self {
            number,
            name: name.into(),
            kind: FieldKind::Group(submsg),
            repeated,
        }
    }

    pub fn field_type(&self) -> FieldType {
        match &self.kind {
            FieldKind::Scalar(ft) => *ft,
            FieldKind::Message(_) => FieldType::Message,
            FieldKind::Group(_) => FieldType::Group,
        }
    }

    pub fn submsg(&self) -> Option<&Rc<MessageDef>> {
        match &self.kind {
            FieldKind::Message(m) | FieldKind::Group(m) => Some(m),
            FieldKind::Scalar(_) => None,
        }
    }
}

/// A message definition. `fqname` is what the traversal-local lookup map in
/// `register_message` keys on to break cycles and share diamond submessages.
#[derive(Debug, PartialEq, Eq)]
pub struct MessageDef {
    pub fqname: String,
    fields: std::cell::RefCell<Vec<FieldDef>>,
}

impl MessageDef {
    pub fn new(fqname: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            fqname: fqname.into(),
            fields: std::cell::RefCell::new(Vec::new()),
        })
    }

    /// Schemas are typically built up field-by-field after the (possibly
    /// self-referential) `Rc<MessageDef>` already exists, so fields live
    /// behind a `RefCell` rather than requiring the whole graph to be
    /// constructed bottom-up before any `Rc` is shared.
    pub fn push_field(&self, field: FieldDef) {
        self.fields.borrow_mut().push(field);
    }

    pub fn fields(&self) -> std::cell::Ref<'_, Vec<FieldDef>> {
        self.fields.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_referential_message_builds() {
        // message Node { Node child = 1; }
        let node = MessageDef::new("Node");
        node.push_field(FieldDef::message(1, "child", node.clone(), false));
        assert_eq!(node.fields().len(), 1);
        assert!(Rc::ptr_eq(node.fields()[0].submsg().unwrap(), &node));
    }

    #[test]
    fn mutual_cycle_builds() {
        // message A { B b = 1; } message B { A a = 1; }
        let a = MessageDef::new("A");
        let b = MessageDef::new("B");
        a.push_field(FieldDef::message(1, "b", b.clone(), false));
        b.push_field(FieldDef::message(1, "a", a.clone(), false));
        assert!(Rc::ptr_eq(a.fields()[0].submsg().unwrap(), &b));
        assert!(Rc::ptr_eq(b.fields()[0].submsg().unwrap(), &a));
    }
}
