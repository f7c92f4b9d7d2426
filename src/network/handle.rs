//! Opaque handles for objects referenced from other nodes.
//!
//! Whenever a message has to name something that lives on the sending node,
//! such as a completion callback or a waiting request, the object is parked in
//! a `HandleRegistry` and only its `Token` travels. The token is
//! resolved again when a message carrying it comes back; peers never
//! interpret it.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A 64-bit opaque handle. Zero on the wire means "no handle".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(NonZeroU64);

impl Token {
    /// Wire form of an optional token.
    #[inline]
    pub fn encode(token: Option<Token>) -> u64 {
        token.map_or(0, |t| t.0.get())
    }

    /// Parse the wire form.
    #[inline]
    pub fn decode(raw: u64) -> Option<Token> {
        NonZeroU64::new(raw).map(Token)
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Token {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Token({:#x})", self.0)
    }
}

/// Local table from tokens to owned objects.
pub struct HandleRegistry<T> {
    next: AtomicU64,
    entries: Mutex<HashMap<u64, T>>,
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Park `value` and return its token.
    pub fn register(
        &self,
        value: T,
    ) -> Token {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(raw, value);
        // the counter starts at one and never wraps in practice
        Token(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Remove and return the object behind `token`.
    pub fn take(
        &self,
        token: Token,
    ) -> Option<T> {
        self.entries.lock().remove(&token.get())
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T: Clone> HandleRegistry<T> {
    /// Clone the object behind `token`, leaving it registered.
    pub fn get(
        &self,
        token: Token,
    ) -> Option<T> {
        self.entries.lock().get(&token.get()).cloned()
    }
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HandleRegistry<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("live", &self.len())
            .finish()
    }
}
