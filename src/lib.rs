//! Callback-registration and event-dispatch core for a streaming
//! protocol-buffers decoder: a handler registry mapping message/field
//! definitions onto user callbacks, and a dispatcher that drives those
//! callbacks as a tokenizer reports start-message/end-message/value/
//! start-submessage/end-submessage events.
//!
//! This crate does not decode bytes, encode messages, or parse `.proto`
//! schemas — it sits between a tokenizer (which turns bytes into wire-format
//! events) and user code (which reacts to them), the same layering
//! `upb_handlers`/`upb_dispatcher` occupy in the C library this is modeled
//! on. `schema` is a minimal stand-in for the real schema representation,
//! just enough for `Registry::register_message`'s reflection walk to have
//! something concrete to traverse.
//!
//! ```
//! use protodispatch::flow::{CbFlow, Flow};
//! use protodispatch::registry::Registry;
//! use protodispatch::dispatch::Dispatcher;
//! use protodispatch::wire::{make_tag, DecodedValue, FieldType};
//! use protodispatch::status::Status;
//!
//! let mut registry: Registry<(), ()> = Registry::new();
//! let msg = registry.new_msg();
//! unsafe { &mut *msg.as_ptr() }
//!     .new_field(1, FieldType::Int32, false)
//!     .set_on_value((), |_closure, _fval, value| {
//!         assert!(matches!(value, DecodedValue::Varint(_)));
//!         CbFlow::Continue
//!     });
//!
//! let mut dispatcher: Dispatcher<(), (), 8> = Dispatcher::init(&mut registry);
//! dispatcher.reset((), -1);
//! assert_eq!(dispatcher.dispatch_startmsg(), Flow::Continue);
//! let field = dispatcher.lookup_field(make_tag(1, FieldType::Int32.native_wire_type())).unwrap();
//! assert_eq!(dispatcher.dispatch_value(field, DecodedValue::Varint(42)), CbFlow::Continue);
//! let mut out = Status::new();
//! dispatcher.dispatch_endmsg(&mut out);
//! assert!(out.is_ok());
//! ```

pub mod dispatch;
pub mod flow;
pub(crate) mod frame;
pub mod registry;
pub mod schema;
pub mod status;
pub mod wire;

pub use dispatch::Dispatcher;
pub use flow::{CbFlow, Flow};
pub use registry::{FieldHandler, MessageTable, OnFieldReg, OnMsgReg, Registry};
pub use schema::{FieldDef, FieldKind, MessageDef};
pub use status::Status;
pub use wire::{make_tag, tag_field_number, tag_wire_type, DecodedValue, FieldType};
