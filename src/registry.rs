//! The callback registry: field handlers (C1), per-message handler tables
//! (C2), and the registry that owns every table for one schema (C3).
//!
//! Ownership mirrors `examples/gerben-stavenga-rust_protobuf/src/arena.rs`:
//! tables are `Box`-owned by `Registry` in a `Vec` so their heap addresses
//! never move, and cross-table links (a field pointing at its submessage's
//! table) are plain non-owning `NonNull` back-references into that storage —
//! the same "owner collection + raw back-reference" shape that bump arena
//! uses, just with `Vec<Box<_>>` standing in for the arena itself.
//! Translated from `upb_fhandlers`/`upb_mhandlers`/`upb_handlers` in
//! `examples/original_source/src/upb_handlers.c`.

use std::collections::HashMap;
use std::ptr::NonNull;

use crate::flow::CbFlow;
use crate::schema::{FieldDef, FieldKind as SchemaFieldKind, MessageDef};
use crate::status::Status;
use crate::wire::{make_tag, DecodedValue, FieldType};
use std::rc::Rc;

type ValueCallback<Z, V> = Box<dyn FnMut(Z, V, DecodedValue<'_>) -> CbFlow>;
type StartSubmsgCallback<Z, V> = Box<dyn FnMut(Z, V) -> (CbFlow, Z)>;
type EndSubmsgCallback<Z, V> = Box<dyn FnMut(Z, V) -> CbFlow>;
type StartMsgCallback<Z> = Box<dyn FnMut(Z) -> CbFlow>;
type EndMsgCallback<Z> = Box<dyn FnMut(Z, &mut Status)>;

fn default_on_value<Z, V>() -> ValueCallback<Z, V> {
    Box::new(|_, _, _| CbFlow::Continue)
}

fn default_on_startsubmsg<Z, V>() -> StartSubmsgCallback<Z, V> {
    Box::new(|z, _| (CbFlow::Continue, z))
}

fn default_on_endsubmsg<Z, V>() -> EndSubmsgCallback<Z, V> {
    Box::new(|_, _| CbFlow::Continue)
}

fn default_on_startmsg<Z>() -> StartMsgCallback<Z> {
    Box::new(|_| CbFlow::Continue)
}

fn default_on_endmsg<Z>() -> EndMsgCallback<Z> {
    Box::new(|_, _| {})
}

/// A single field's callback slot (C1). `fval` is one opaque, `Copy` user
/// value shared by all three callbacks on this field, set by whichever
/// `set_on_*` call the caller uses.
pub struct FieldHandler<Z, V> {
    number: u32,
    field_type: FieldType,
    repeated: bool,
    fval: V,
    submsg: Option<NonNull<MessageTable<Z, V>>>,
    on_value: ValueCallback<Z, V>,
    on_startsubmsg: StartSubmsgCallback<Z, V>,
    on_endsubmsg: EndSubmsgCallback<Z, V>,
}

impl<Z, V: Copy + Default> FieldHandler<Z, V> {
    fn new(number: u32, field_type: FieldType, repeated: bool, submsg: Option<NonNull<MessageTable<Z, V>>>) -> Self {
        Self {
            number,
            field_type,
            repeated,
            fval: V::default(),
            submsg,
            on_value: default_on_value(),
            on_startsubmsg: default_on_startsubmsg(),
            on_endsubmsg: default_on_endsubmsg(),
        }
    }

    /// The root frame's sentinel descriptor planted at `stack[0].f` by
    /// `Dispatcher::init`. Type GROUP with no sub-table — the one place the
    /// "GROUP implies submsg" invariant is deliberately broken, because this
    /// descriptor is never looked up by tag, only used to drive
    /// `dispatch_endsubmsg`'s msgent-restore fallback to `registry.msgs[0]`.
    pub(crate) fn sentinel() -> Self {
        Self {
            number: 0,
            field_type: FieldType::Group,
            repeated: false,
            fval: V::default(),
            submsg: None,
            on_value: default_on_value(),
            on_startsubmsg: default_on_startsubmsg(),
            on_endsubmsg: default_on_endsubmsg(),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn repeated(&self) -> bool {
        self.repeated
    }

    pub fn packed(&self) -> bool {
        self.repeated && self.field_type.is_primitive()
    }

    pub fn fval(&self) -> V {
        self.fval
    }

    pub fn tag(&self) -> u32 {
        make_tag(self.number, self.field_type.native_wire_type())
    }

    pub(crate) fn submsg(&self) -> Option<NonNull<MessageTable<Z, V>>> {
        self.submsg
    }

    pub fn set_on_value(&mut self, fval: V, cb: impl FnMut(Z, V, DecodedValue<'_>) -> CbFlow + 'static) -> &mut Self {
        self.fval = fval;
        self.on_value = Box::new(cb);
        self
    }

    pub fn set_on_startsubmsg(&mut self, fval: V, cb: impl FnMut(Z, V) -> (CbFlow, Z) + 'static) -> &mut Self {
        self.fval = fval;
        self.on_startsubmsg = Box::new(cb);
        self
    }

    /// Reuses whatever `fval` an earlier `set_on_value`/`set_on_startsubmsg`
    /// call installed — there is only ever one `fval` per field.
    pub fn set_on_endsubmsg(&mut self, cb: impl FnMut(Z, V) -> CbFlow + 'static) -> &mut Self {
        self.on_endsubmsg = Box::new(cb);
        self
    }

    pub(crate) fn call_on_value(&mut self, closure: Z, value: DecodedValue<'_>) -> CbFlow {
        (self.on_value)(closure, self.fval, value)
    }

    pub(crate) fn call_on_startsubmsg(&mut self, closure: Z) -> (CbFlow, Z) {
        (self.on_startsubmsg)(closure, self.fval)
    }

    pub(crate) fn call_on_endsubmsg(&mut self, closure: Z) -> CbFlow {
        (self.on_endsubmsg)(closure, self.fval)
    }
}

/// A single message type's field table (C2): one `on_startmsg`/`on_endmsg`
/// pair plus a tag-keyed map of field handlers.
pub struct MessageTable<Z, V> {
    fields: HashMap<u32, Box<FieldHandler<Z, V>>>,
    dense: Option<Vec<Option<NonNull<FieldHandler<Z, V>>>>>,
    on_startmsg: StartMsgCallback<Z>,
    on_endmsg: EndMsgCallback<Z>,
    is_group: bool,
}

impl<Z, V: Copy + Default> MessageTable<Z, V> {
    fn new() -> Self {
        Self {
            fields: HashMap::new(),
            dense: None,
            on_startmsg: default_on_startmsg(),
            on_endmsg: default_on_endmsg(),
            is_group: false,
        }
    }

    pub fn is_group(&self) -> bool {
        self.is_group
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn set_on_startmsg(&mut self, cb: impl FnMut(Z) -> CbFlow + 'static) -> &mut Self {
        self.on_startmsg = Box::new(cb);
        self
    }

    pub fn set_on_endmsg(&mut self, cb: impl FnMut(Z, &mut Status) + 'static) -> &mut Self {
        self.on_endmsg = Box::new(cb);
        self
    }

    /// Registers a scalar (non-submessage) field. Panics on a duplicate wire
    /// tag or if `field_type` names a submessage/group type — both are
    /// programming errors in the registering code, not recoverable runtime
    /// conditions.
    pub fn new_field(&mut self, number: u32, field_type: FieldType, repeated: bool) -> &mut FieldHandler<Z, V> {
        assert!(
            !field_type.is_submessage(),
            "new_field: {field_type:?} is a submessage type, use new_submsg_field"
        );
        self.insert_field(number, field_type, repeated, None)
    }

    /// Registers a MESSAGE or GROUP field whose values dispatch into
    /// `subtable`. For GROUP fields this also plants the synthetic ENDGROUP
    /// terminator into `subtable` with the same field number.
    pub fn new_submsg_field(
        &mut self,
        number: u32,
        field_type: FieldType,
        repeated: bool,
        subtable: NonNull<MessageTable<Z, V>>,
    ) -> &mut FieldHandler<Z, V> {
        assert!(
            field_type.is_submessage(),
            "new_submsg_field: {field_type:?} is not a submessage type"
        );
        if field_type == FieldType::Group {
            unsafe { &mut *subtable.as_ptr() }.is_group = true;
            unsafe { &mut *subtable.as_ptr() }.insert_field(number, FieldType::EndGroup, false, None);
        }
        self.insert_field(number, field_type, repeated, Some(subtable))
    }

    fn insert_field(
        &mut self,
        number: u32,
        field_type: FieldType,
        repeated: bool,
        submsg: Option<NonNull<MessageTable<Z, V>>>,
    ) -> &mut FieldHandler<Z, V> {
        let tag = make_tag(number, field_type.native_wire_type());
        if self.fields.contains_key(&tag) {
            panic!("duplicate wire tag {tag} (field number {number}) registered on the same message table");
        }
        assert!(self.dense.is_none(), "new fields cannot be registered after the table is compacted");
        self.fields.insert(tag, Box::new(FieldHandler::new(number, field_type, repeated, submsg)));
        self.fields.get_mut(&tag).unwrap().as_mut()
    }

    pub(crate) fn entry(&self, tag: u32) -> Option<NonNull<FieldHandler<Z, V>>> {
        if let Some(dense) = &self.dense {
            return dense.get(tag as usize).copied().flatten();
        }
        self.fields.get(&tag).map(|handler| NonNull::from(handler.as_ref()))
    }

    pub(crate) fn call_on_startmsg(&mut self, closure: Z) -> CbFlow {
        (self.on_startmsg)(closure)
    }

    pub(crate) fn call_on_endmsg(&mut self, closure: Z, status: &mut Status) {
        (self.on_endmsg)(closure, status)
    }

    /// Re-lays the tag map out as a dense array when tags are dense enough
    /// to make that worthwhile, so dispatch-time lookup is an index instead
    /// of a hash. Idempotent; `Dispatcher::init` calls this once per table.
    pub(crate) fn compact(&mut self) {
        if self.fields.is_empty() || self.dense.is_some() {
            return;
        }
        let max_tag = *self.fields.keys().max().unwrap();
        if (max_tag as usize) <= self.fields.len() * 4 + 64 {
            let mut dense = vec![None; max_tag as usize + 1];
            for (&tag, handler) in self.fields.iter() {
                dense[tag as usize] = Some(NonNull::from(handler.as_ref()));
            }
            self.dense = Some(dense);
        }
    }
}

/// Callback invoked once per message encountered during `register_message`'s
/// depth-first traversal, to let the caller attach `on_startmsg`/`on_endmsg`.
/// A plain function pointer, not a closure, mirroring `upb_onmsgreg` — the
/// reflection walk is a one-time registration step, not part of the
/// per-message dispatch hot path, so there's no need to capture state beyond
/// what `closure` already threads through.
pub type OnMsgReg<R, Z, V> = fn(&mut R, NonNull<MessageTable<Z, V>>, &MessageDef);

/// Callback invoked once per field during the same traversal, to attach
/// `on_value`/`on_startsubmsg`/`on_endsubmsg`.
pub type OnFieldReg<R, Z, V> = fn(&mut R, &mut FieldHandler<Z, V>, &FieldDef);

/// Owns every message table for one schema (C3). `msgs[0]` — whichever
/// table was allocated first — is the distinguished top-level (entry)
/// message a `Dispatcher` starts from.
pub struct Registry<Z, V> {
    msgs: Vec<Box<MessageTable<Z, V>>>,
    pub should_jit: bool,
}

impl<Z, V: Copy + Default> Registry<Z, V> {
    pub fn new() -> Self {
        Self {
            msgs: Vec::new(),
            should_jit: true,
        }
    }

    pub fn msgs_len(&self) -> usize {
        self.msgs.len()
    }

    pub fn top_level(&self) -> Option<NonNull<MessageTable<Z, V>>> {
        self.msgs.first().map(|table| NonNull::from(table.as_ref()))
    }

    /// Allocates a new, empty message table owned by this registry.
    pub fn new_msg(&mut self) -> NonNull<MessageTable<Z, V>> {
        let mut table = Box::new(MessageTable::new());
        let ptr = NonNull::from(table.as_mut());
        self.msgs.push(table);
        ptr
    }

    pub(crate) fn compact_all(&mut self) {
        for table in &mut self.msgs {
            table.compact();
        }
    }

    /// Reflection-based registration (C3): walks `root`'s schema graph
    /// depth-first, allocating one table per distinct message and one field
    /// handler per field, invoking `on_msg`/`on_field` so the caller can wire
    /// up real callbacks. A traversal-local `fqname -> table` map breaks
    /// cycles and shares diamond submessages, so a message referenced twice
    /// (or recursively) gets exactly one table.
    pub fn register_message<R>(
        &mut self,
        root: &Rc<MessageDef>,
        on_msg: Option<OnMsgReg<R, Z, V>>,
        on_field: Option<OnFieldReg<R, Z, V>>,
        closure: &mut R,
    ) -> NonNull<MessageTable<Z, V>> {
        let mut seen: HashMap<String, NonNull<MessageTable<Z, V>>> = HashMap::new();
        self.register_dfs(root, on_msg, on_field, closure, &mut seen)
    }

    fn register_dfs<R>(
        &mut self,
        def: &Rc<MessageDef>,
        on_msg: Option<OnMsgReg<R, Z, V>>,
        on_field: Option<OnFieldReg<R, Z, V>>,
        closure: &mut R,
        seen: &mut HashMap<String, NonNull<MessageTable<Z, V>>>,
    ) -> NonNull<MessageTable<Z, V>> {
        let table = self.new_msg();
        seen.insert(def.fqname.clone(), table);
        if let Some(cb) = on_msg {
            cb(closure, table, def);
        }
        for field in def.fields().iter() {
            match &field.kind {
                SchemaFieldKind::Scalar(field_type) => {
                    let handler = unsafe { &mut *table.as_ptr() }.new_field(field.number, *field_type, field.repeated);
                    if let Some(cb) = on_field {
                        cb(closure, handler, field);
                    }
                }
                SchemaFieldKind::Message(sub) | SchemaFieldKind::Group(sub) => {
                    let is_group = matches!(field.kind, SchemaFieldKind::Group(_));
                    let sub_table = match seen.get(&sub.fqname) {
                        Some(&existing) => existing,
                        None => self.register_dfs(sub, on_msg, on_field, closure, seen),
                    };
                    let field_type = if is_group { FieldType::Group } else { FieldType::Message };
                    let handler =
                        unsafe { &mut *table.as_ptr() }.new_submsg_field(field.number, field_type, field.repeated, sub_table);
                    if let Some(cb) = on_field {
                        cb(closure, handler, field);
                    }
                }
            }
        }
        table
    }
}

impl<Z, V: Copy + Default> Default for Registry<Z, V> {
    fn default() -> Self {
        Self::new()
    }
}
