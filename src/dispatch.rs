//! The dispatcher (C4): per-parse state machine that walks a `Registry`'s
//! tables as the parser reports start-message/end-message/start-submessage/
//! end-submessage events, plus the skip/break state machine that lets a
//! callback abandon a subtree (or, via delegation, abandon several nested
//! dispatchers at once) without unwinding through Rust's own call stack.
//!
//! Translated from `upb_dispatch_startmsg`/`endmsg`/`startsubmsg`/
//! `endsubmsg`/`upb_dispatcher_break` in
//! `examples/original_source/src/upb_handlers.c`.

use std::ptr::NonNull;

use crate::flow::{CbFlow, Flow};
use crate::frame::FrameStack;
use crate::registry::{FieldHandler, MessageTable, Registry};
use crate::status::Status;
use crate::wire::DecodedValue;

/// `+∞` sentinel for `skip_depth`/`noframe_depth`: "not currently skipping
/// anything". `current_depth` never gets close to this in practice — nesting
/// is already bounded by `MAX_NESTING` — so the sentinel can't be confused
/// with a real depth.
const INF_DEPTH: i64 = i64::MAX;

struct Frame<Z, V> {
    f: NonNull<FieldHandler<Z, V>>,
    closure: Z,
    end_offset: i64,
    is_packed: bool,
}

/// Per-parse dispatch state. `MAX_NESTING` bounds the frame stack at compile
/// time (`FrameStack`, generalized from `examples/gerben-stavenga-rust_protobuf/src/utils.rs`'s `StackWithStorage`);
/// exceeding it is a recoverable error (`Status::set_error`), not a panic,
/// since untrusted input controls nesting depth.
pub struct Dispatcher<'r, Z, V, const MAX_NESTING: usize> {
    registry: &'r Registry<Z, V>,
    stack: FrameStack<Frame<Z, V>, MAX_NESTING>,
    msgent: NonNull<MessageTable<Z, V>>,
    current_depth: i64,
    skip_depth: i64,
    noframe_depth: i64,
    delegated_depth: i64,
    status: Status,
    toplevel: Box<FieldHandler<Z, V>>,
}

impl<'r, Z: Clone, V: Copy + Default, const MAX_NESTING: usize> Dispatcher<'r, Z, V, MAX_NESTING> {
    /// Compacts every table in `registry` (see `MessageTable::compact`) and
    /// builds a dispatcher ready for `reset`. `registry` must contain at
    /// least one message table — `Registry::new_msg` (directly, or via
    /// `register_message`) must have been called at least once.
    pub fn init(registry: &'r mut Registry<Z, V>) -> Self {
        registry.compact_all();
        let registry: &'r Registry<Z, V> = registry;
        let msgent = registry
            .top_level()
            .expect("registry has no message tables; call new_msg/register_message before Dispatcher::init");
        Self {
            registry,
            stack: FrameStack::new(),
            msgent,
            current_depth: 0,
            skip_depth: INF_DEPTH,
            noframe_depth: INF_DEPTH,
            delegated_depth: 0,
            status: Status::new(),
            toplevel: Box::new(FieldHandler::sentinel()),
        }
    }

    /// Prepares the dispatcher for a new top-level message, planting the
    /// root frame (`stack[0]`) with the caller-supplied closure and end
    /// offset, and clearing all depth/skip state.
    pub fn reset(&mut self, top_closure: Z, top_end_offset: i64) {
        self.msgent = self
            .registry
            .top_level()
            .expect("registry has no message tables");
        self.current_depth = 0;
        self.delegated_depth = 0;
        self.skip_depth = INF_DEPTH;
        self.noframe_depth = INF_DEPTH;
        self.status = Status::new();
        self.stack = FrameStack::new();
        self.stack
            .push(Frame {
                f: NonNull::from(self.toplevel.as_ref()),
                closure: top_closure,
                end_offset: top_end_offset,
                is_packed: false,
            })
            .expect("MAX_NESTING must be at least 1");
    }

    fn skipping(&self) -> bool {
        self.current_depth >= self.skip_depth
    }

    fn noframe(&self) -> bool {
        self.current_depth >= self.noframe_depth
    }

    fn top_closure(&self) -> Z {
        self.stack.top().expect("dispatcher stack must never be empty").closure.clone()
    }

    /// Declares the current subtree terminated without requesting outer
    /// propagation: only `noframe_depth` moves, `skip_depth` stays `+∞`, so
    /// this does not itself put the dispatcher into the skipping state (that
    /// is what distinguishes `break_dispatch` from a callback returning
    /// `Break`, which sets both). Calling this outside a callback, or while
    /// already skipping, is a programming error.
    pub fn break_dispatch(&mut self) {
        assert_eq!(self.skip_depth, INF_DEPTH, "break_dispatch called while already skipping");
        assert_eq!(self.noframe_depth, INF_DEPTH, "break_dispatch called while already skipping");
        self.noframe_depth = self.current_depth;
    }

    pub fn current_depth(&self) -> i64 {
        self.current_depth
    }

    pub fn delegated_depth(&self) -> i64 {
        self.delegated_depth
    }

    /// Sets the depth a `break_dispatch` (or a BREAK-returning callback) in
    /// *this* dispatcher unwinds to. An outer dispatcher composing an inner
    /// one sets this on the inner dispatcher to its own current depth at
    /// hand-off, so a BREAK in the inner dispatcher propagates out to the
    /// outer one's frame instead of stopping at the inner dispatcher's own
    /// root.
    pub fn set_delegated_depth(&mut self, depth: i64) {
        self.delegated_depth = depth;
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn is_skipping(&self) -> bool {
        self.skipping()
    }

    pub fn top_end_offset(&self) -> i64 {
        self.stack.top().expect("dispatcher stack must never be empty").end_offset
    }

    pub fn top_is_packed(&self) -> bool {
        self.stack.top().expect("dispatcher stack must never be empty").is_packed
    }

    pub fn set_top_is_packed(&mut self, is_packed: bool) {
        self.stack.top_mut().expect("dispatcher stack must never be empty").is_packed = is_packed;
    }

    /// Looks up the field handler for `tag` in the currently active
    /// message's table, if any is registered. The parser drives value and
    /// submessage dispatch by calling this and then `dispatch_value` /
    /// `dispatch_startsubmsg` directly — the dispatcher does not mediate
    /// value calls itself.
    pub fn lookup_field(&self, tag: u32) -> Option<NonNull<FieldHandler<Z, V>>> {
        unsafe { self.msgent.as_ref() }.entry(tag)
    }

    /// Invokes `field`'s `on_value` callback with the current frame's
    /// closure. Does not consult skip state — the parser is expected to
    /// check `is_skipping()` itself before bothering to decode a value at
    /// all.
    pub fn dispatch_value(&mut self, field: NonNull<FieldHandler<Z, V>>, value: DecodedValue<'_>) -> CbFlow {
        let closure = self.top_closure();
        unsafe { &mut *field.as_ptr() }.call_on_value(closure, value)
    }

    /// Invokes the current message's `on_startmsg`. Called once per message,
    /// including the outermost one (by the parser directly) and every
    /// submessage (internally, as the tail of `dispatch_startsubmsg`).
    pub fn dispatch_startmsg(&mut self) -> Flow {
        let closure = self.top_closure();
        let cb_flow = unsafe { &mut *self.msgent.as_ptr() }.call_on_startmsg(closure);
        if cb_flow != CbFlow::Continue {
            self.noframe_depth = self.current_depth + 1;
            self.skip_depth = if cb_flow == CbFlow::Break { self.delegated_depth } else { self.current_depth };
            return Flow::SkipSubmsg;
        }
        Flow::Continue
    }

    /// Invokes the root message's `on_endmsg` and copies the dispatcher's
    /// accumulated status out to `status_out` (first-error-wins, matching
    /// `upb_copyerr`). Only valid when the frame stack is back down to just
    /// the root frame — i.e. every submessage opened has also been closed.
    pub fn dispatch_endmsg(&mut self, status_out: &mut Status) {
        assert_eq!(self.stack.len(), 1, "dispatch_endmsg called with unclosed submessages still on the stack");
        let closure = self.top_closure();
        unsafe { &mut *self.msgent.as_ptr() }.call_on_endmsg(closure, &mut self.status);
        status_out.copy_from(&self.status);
    }

    /// Enters a submessage for `field` (a field handler of MESSAGE or GROUP
    /// type). Pushes a new frame and tail-calls into `dispatch_startmsg` for
    /// it, unless skipping was already in effect, the `on_startsubmsg`
    /// callback itself declines to continue, or the frame stack is already
    /// at `MAX_NESTING`.
    pub fn dispatch_startsubmsg(&mut self, field: NonNull<FieldHandler<Z, V>>, end_offset: i64) -> Flow {
        self.current_depth += 1;
        if self.skipping() {
            return Flow::SkipSubmsg;
        }

        let closure = self.top_closure();
        let (cb_flow, child_closure) = unsafe { &mut *field.as_ptr() }.call_on_startsubmsg(closure);
        if cb_flow != CbFlow::Continue {
            self.noframe_depth = self.current_depth;
            self.skip_depth = if cb_flow == CbFlow::Break { self.delegated_depth } else { self.current_depth };
            return Flow::SkipSubmsg;
        }

        if self
            .stack
            .push(Frame {
                f: field,
                closure: child_closure,
                end_offset,
                is_packed: false,
            })
            .is_none()
        {
            self.status.set_error("message nesting exceeds configured maximum");
            self.noframe_depth = self.current_depth;
            self.skip_depth = self.delegated_depth;
            return Flow::SkipSubmsg;
        }

        self.msgent = unsafe { field.as_ref() }
            .submsg()
            .expect("dispatch_startsubmsg called on a field with no sub-table");
        self.dispatch_startmsg()
    }

    /// Leaves the current submessage: invokes its `on_endmsg`, pops its
    /// frame, restores `msgent` to the parent message's table (or the
    /// registry's top-level table if the parent is the root), clears
    /// `noframe_depth`, clears `skip_depth` too unless a still-active skip
    /// covers a shallower depth, then invokes the popped field's
    /// `on_endsubmsg` with the parent's closure. `current_depth` is
    /// decremented only at the very end, after that callback runs, so the
    /// `skipping()` check above sees the depth the just-closed subtree was
    /// entered at, not the parent's depth.
    pub fn dispatch_endsubmsg(&mut self) -> Flow {
        if self.noframe() {
            self.current_depth -= 1;
            return Flow::SkipSubmsg;
        }

        assert!(self.stack.len() > 1, "dispatch_endsubmsg called with no submessage frame to close");
        let current_closure = self.stack.top().expect("checked above").closure.clone();
        unsafe { &mut *self.msgent.as_ptr() }.call_on_endmsg(current_closure, &mut self.status);

        let popped = self.stack.pop().expect("checked above");
        let parent = self.stack.top().expect("root frame is never popped");
        self.msgent = unsafe { parent.f.as_ref() }
            .submsg()
            .unwrap_or_else(|| self.registry.top_level().expect("registry has a top-level table"));
        self.noframe_depth = INF_DEPTH;
        if !self.skipping() {
            self.skip_depth = INF_DEPTH;
        }

        let parent_closure = parent.closure.clone();
        let cb_flow = unsafe { &mut *popped.f.as_ptr() }.call_on_endsubmsg(parent_closure);
        let flow = if cb_flow != CbFlow::Continue {
            self.noframe_depth = self.current_depth + 1;
            self.skip_depth = if cb_flow == CbFlow::Break { self.delegated_depth } else { self.current_depth };
            Flow::SkipSubmsg
        } else {
            Flow::Continue
        };
        self.current_depth -= 1;
        flow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::wire::FieldType;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    fn build_flat_registry() -> Registry<Log, ()> {
        let mut registry: Registry<Log, ()> = Registry::new();
        let msg = registry.new_msg();
        let table = unsafe { &mut *msg.as_ptr() };
        table.set_on_startmsg(|log: Log| {
            log.borrow_mut().push("start".into());
            CbFlow::Continue
        });
        table.set_on_endmsg(|log: Log, _status| {
            log.borrow_mut().push("end".into());
        });
        table.new_field(1, FieldType::Int32, false).set_on_value((), |log: Log, _fval, value| {
            log.borrow_mut().push(format!("value:{value:?}"));
            CbFlow::Continue
        });
        registry
    }

    // Scenario S1: flat message, a handful of scalar values dispatched in
    // order, on_startmsg before any value, on_endmsg after.
    #[test]
    fn flat_message_dispatch_order() {
        let mut registry = build_flat_registry();
        let mut dispatcher: Dispatcher<Log, (), 4> = Dispatcher::init(&mut registry);
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        dispatcher.reset(log.clone(), -1);

        assert_eq!(dispatcher.dispatch_startmsg(), Flow::Continue);
        let field = dispatcher.lookup_field(crate::wire::make_tag(1, FieldType::Int32.native_wire_type())).unwrap();
        assert_eq!(dispatcher.dispatch_value(field, DecodedValue::Varint(7)), CbFlow::Continue);
        let mut out = Status::new();
        dispatcher.dispatch_endmsg(&mut out);

        assert_eq!(*log.borrow(), vec!["start".to_string(), "value:Varint(7)".to_string(), "end".to_string()]);
        assert!(out.is_ok());
        assert_eq!(dispatcher.current_depth(), 0);
    }

    // Scenario S2: a nested submessage fully dispatched and closed leaves
    // depth and skip state back at rest.
    #[test]
    fn nested_submessage_round_trip_resets_depth_and_skip_state() {
        let mut registry: Registry<Log, ()> = Registry::new();
        let parent = registry.new_msg();
        let child = registry.new_msg();
        unsafe { &mut *child.as_ptr() }.new_field(1, FieldType::Int32, false);
        unsafe { &mut *parent.as_ptr() }.new_submsg_field(2, FieldType::Message, false, child);
        assert_eq!(registry.top_level().unwrap(), parent);

        let mut dispatcher: Dispatcher<Log, (), 4> = Dispatcher::init(&mut registry);
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        dispatcher.reset(log.clone(), -1);

        assert_eq!(dispatcher.dispatch_startmsg(), Flow::Continue);
        let submsg_field = dispatcher.lookup_field(crate::wire::make_tag(2, FieldType::Message.native_wire_type())).unwrap();
        assert_eq!(dispatcher.dispatch_startsubmsg(submsg_field, -1), Flow::Continue);
        assert_eq!(dispatcher.current_depth(), 1);
        assert_eq!(dispatcher.dispatch_endsubmsg(), Flow::Continue);
        assert_eq!(dispatcher.current_depth(), 0);

        let mut out = Status::new();
        dispatcher.dispatch_endmsg(&mut out);
        assert!(out.is_ok());
    }

    // Scenario S3: SKIPSUBMSG returned from on_startsubmsg skips exactly the
    // entered subtree without touching sibling dispatch afterward.
    #[test]
    fn skip_at_start_submsg_skips_only_that_subtree() {
        let mut registry: Registry<Log, ()> = Registry::new();
        let parent = registry.new_msg();
        let child = registry.new_msg();
        unsafe { &mut *child.as_ptr() }.new_field(1, FieldType::Int32, false).set_on_value((), |log: Log, _, _| {
            log.borrow_mut().push("should-not-run".into());
            CbFlow::Continue
        });
        unsafe { &mut *parent.as_ptr() }
            .new_submsg_field(2, FieldType::Message, false, child)
            .set_on_startsubmsg((), |log: Log, _| {
                log.borrow_mut().push("entered-but-skipped".into());
                (CbFlow::SkipSubmsg, log)
            });

        let mut dispatcher: Dispatcher<Log, (), 4> = Dispatcher::init(&mut registry);
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        dispatcher.reset(log.clone(), -1);
        dispatcher.dispatch_startmsg();

        let submsg_field = dispatcher.lookup_field(crate::wire::make_tag(2, FieldType::Message.native_wire_type())).unwrap();
        assert_eq!(dispatcher.dispatch_startsubmsg(submsg_field, -1), Flow::SkipSubmsg);
        assert!(dispatcher.is_skipping());
        assert_eq!(dispatcher.dispatch_endsubmsg(), Flow::SkipSubmsg);
        assert!(!dispatcher.is_skipping());
        assert_eq!(*log.borrow(), vec!["entered-but-skipped".to_string()]);
    }

    // Scenario S4: nesting deeper than MAX_NESTING is a recoverable error,
    // not a panic.
    #[test]
    fn nesting_past_max_records_recoverable_status_error() {
        let node = crate::schema::MessageDef::new("Node");
        node.push_field(crate::schema::FieldDef::message(1, "child", node.clone(), false));
        let mut registry: Registry<Log, ()> = Registry::new();
        let mut closure = ();
        let top = registry.register_message::<()>(&node, None, None, &mut closure);
        let field_tag = crate::wire::make_tag(1, FieldType::Message.native_wire_type());
        let field = unsafe { top.as_ref() }.entry(field_tag).unwrap();

        let mut dispatcher: Dispatcher<Log, (), 2> = Dispatcher::init(&mut registry);
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        dispatcher.reset(log.clone(), -1);
        dispatcher.dispatch_startmsg();

        assert_eq!(dispatcher.dispatch_startsubmsg(field, -1), Flow::Continue);
        // MAX_NESTING=2 means stack[0] (root) + stack[1] (this frame) is
        // already full; a second nested push must fail.
        assert_eq!(dispatcher.dispatch_startsubmsg(field, -1), Flow::SkipSubmsg);
        assert!(!dispatcher.status().is_ok());
    }

    // Regression: when a pushed frame's own on_startmsg declines (setting
    // skip_depth at the depth that frame was entered at), closing that frame
    // must not clear skip_depth early — a following sibling sub-message at
    // the same depth must stay skipped too, until the dispatcher ascends
    // past that depth.
    #[test]
    fn sibling_submsg_stays_skipped_after_framed_skip_closes() {
        let mut registry: Registry<Log, ()> = Registry::new();
        let parent = registry.new_msg();
        let inner_a = registry.new_msg();
        let inner_b = registry.new_msg();

        unsafe { &mut *inner_a.as_ptr() }.set_on_startmsg(|log: Log| {
            log.borrow_mut().push("a-start-declines".into());
            CbFlow::SkipSubmsg
        });
        unsafe { &mut *parent.as_ptr() }.new_submsg_field(2, FieldType::Message, false, inner_a);
        unsafe { &mut *parent.as_ptr() }
            .new_submsg_field(3, FieldType::Message, false, inner_b)
            .set_on_startsubmsg((), |log: Log, _| {
                log.borrow_mut().push("b-entered".into());
                (CbFlow::Continue, log)
            });

        let mut dispatcher: Dispatcher<Log, (), 4> = Dispatcher::init(&mut registry);
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        dispatcher.reset(log.clone(), -1);
        dispatcher.dispatch_startmsg();

        let field_a = dispatcher.lookup_field(crate::wire::make_tag(2, FieldType::Message.native_wire_type())).unwrap();
        assert_eq!(dispatcher.dispatch_startsubmsg(field_a, -1), Flow::SkipSubmsg);
        assert_eq!(dispatcher.dispatch_endsubmsg(), Flow::Continue);

        let field_b = dispatcher.lookup_field(crate::wire::make_tag(3, FieldType::Message.native_wire_type())).unwrap();
        assert_eq!(dispatcher.dispatch_startsubmsg(field_b, -1), Flow::SkipSubmsg);

        assert_eq!(*log.borrow(), vec!["a-start-declines".to_string()]);
    }

    // Testable property 5: after dispatch_endmsg, current_depth is back to 0
    // and both skip-state depths are back to the +∞ sentinel, even after a
    // nested submessage was entered and skipped partway through.
    #[test]
    fn endmsg_leaves_depth_and_skip_state_at_rest() {
        let mut registry: Registry<Log, ()> = Registry::new();
        let parent = registry.new_msg();
        let child = registry.new_msg();
        unsafe { &mut *child.as_ptr() }.new_field(1, FieldType::Int32, false);
        unsafe { &mut *parent.as_ptr() }.new_submsg_field(2, FieldType::Message, false, child);

        let mut dispatcher: Dispatcher<Log, (), 4> = Dispatcher::init(&mut registry);
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        dispatcher.reset(log.clone(), -1);
        dispatcher.dispatch_startmsg();

        let submsg_field = dispatcher.lookup_field(crate::wire::make_tag(2, FieldType::Message.native_wire_type())).unwrap();
        dispatcher.dispatch_startsubmsg(submsg_field, -1);
        dispatcher.dispatch_endsubmsg();

        let mut out = Status::new();
        dispatcher.dispatch_endmsg(&mut out);

        assert_eq!(dispatcher.current_depth(), 0);
        assert!(!dispatcher.is_skipping());
        assert_eq!(dispatcher.noframe_depth, INF_DEPTH);
        assert_eq!(dispatcher.skip_depth, INF_DEPTH);
    }

    // break_dispatch declares the current subtree terminated without
    // requesting outer propagation: noframe_depth moves to current_depth but
    // skip_depth stays at +∞, so the dispatcher is not put into the skipping
    // state by this call alone (that's what a callback returning Break does
    // instead).
    #[test]
    fn break_dispatch_sets_noframe_without_skipping() {
        let mut registry = build_flat_registry();
        let mut dispatcher: Dispatcher<Log, (), 4> = Dispatcher::init(&mut registry);
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        dispatcher.reset(log.clone(), -1);
        dispatcher.set_delegated_depth(0);
        dispatcher.dispatch_startmsg();

        dispatcher.break_dispatch();
        assert_eq!(dispatcher.delegated_depth(), 0);
        assert_eq!(dispatcher.noframe_depth, dispatcher.current_depth());
        assert!(!dispatcher.is_skipping());
    }
}
