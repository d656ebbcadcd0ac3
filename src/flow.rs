//! Flow signals passed between user callbacks, the dispatcher, and the
//! parser.

/// What a dispatch entry point hands back to the parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    SkipSubmsg,
}

/// What a user callback hands back to the dispatcher. `Break` is only
/// meaningful coming from a callback; the dispatcher never returns it to the
/// parser — it is always translated into skip state first (see
/// `Dispatcher::dispatch_startmsg`/`dispatch_startsubmsg`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CbFlow {
    Continue,
    SkipSubmsg,
    Break,
}
