//! Accumulated error record handed to `on_endmsg` callbacks and copied out to
//! the caller at `dispatch_endmsg`.
//!
//! Mirrors `upb_status` from the source library: a single message slot, not a
//! list, because only one recoverable error kind (nesting overflow) can occur
//! per top-level message, and the first one reported is the one that matters.

#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Status {
    message: Option<String>,
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ok(&self) -> bool {
        self.message.is_none()
    }

    /// Records an error. First call wins; later calls are ignored until `clear`.
    pub fn set_error(&mut self, message: impl Into<String>) {
        if self.message.is_none() {
            self.message = Some(message.into());
        }
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn clear(&mut self) {
        self.message = None;
    }

    /// Copies `other`'s error into `self`, first-error-wins (used at
    /// `dispatch_endmsg` to hand the dispatcher's accumulated status to the
    /// caller's buffer, matching `upb_copyerr`).
    pub fn copy_from(&mut self, other: &Status) {
        if let Some(msg) = &other.message {
            self.set_error(msg.clone());
        }
    }
}
