//! Medium payload fragments
//!
//! Medium messages whose payload is a descriptor list (GET requests, region
//! metadata, directory replies) can outgrow the transport's medium limit. The
//! sender splits such a payload into pieces of at most `max_medium` bytes and
//! sends one message per piece, each carrying the full argument list plus a
//! trailer of two arguments:
//!
//! ```text
//! [args..][offset][total_len]
//! ```
//!
//! Delivery between two nodes is in order, so the receiver appends pieces as
//! they come and hands the rebuilt message to the handlers once `total_len`
//! bytes are in. Pieces of one message are told apart from those of another
//! by source, tag and the first argument (a sequence number or a token).

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::transport::{Message, MessageTag, NodeId};

/// Arguments the trailer adds to every piece.
pub const TRAILER_ARGS: usize = 2;

/// Split `message` into pieces of at most `max_medium` payload bytes.
///
/// Always adds the trailer, so a message that fits still travels as one piece.
pub fn split(
    message: Message,
    max_medium: usize,
) -> SmallVec<[Message; 1]> {
    let piece_len = max_medium.max(1);
    let total = message.payload.len();
    let mut pieces = SmallVec::new();

    let mut offset = 0;
    loop {
        let end = (offset + piece_len).min(total);
        let mut args = message.args.clone();
        args.push(offset as u64);
        args.push(total as u64);
        pieces.push(Message {
            tag: message.tag,
            args,
            payload: message.payload.slice(offset..end),
            landing: None,
        });
        offset = end;
        if offset >= total {
            break;
        }
    }
    pieces
}

type Key = (NodeId, MessageTag, u64);

/// Receiver side: payloads being rebuilt.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    partial: Mutex<HashMap<Key, BytesMut>>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one piece from `source`; returns the whole message once complete.
    pub fn accept(
        &self,
        source: NodeId,
        mut message: Message,
    ) -> Option<Message> {
        let n = message.args.len();
        if n < TRAILER_ARGS {
            tracing::warn!(%source, tag = ?message.tag, "piece without fragment trailer");
            return None;
        }
        let total = message.args[n - 1] as usize;
        let offset = message.args[n - 2] as usize;
        message.args.truncate(n - TRAILER_ARGS);

        if offset == 0 && message.payload.len() == total {
            return Some(message);
        }

        let key = (source, message.tag, message.args.first().copied().unwrap_or(0));
        let mut partial = self.partial.lock();
        let buffer = partial
            .entry(key)
            .or_insert_with(|| BytesMut::with_capacity(total));
        if buffer.len() != offset || offset + message.payload.len() > total {
            tracing::warn!(%source, tag = ?message.tag, offset, total, "piece out of place, dropping message");
            partial.remove(&key);
            return None;
        }
        buffer.extend_from_slice(&message.payload);
        if buffer.len() < total {
            return None;
        }

        let whole: Bytes = partial.remove(&key)?.freeze();
        message.payload = whole;
        Some(message)
    }

    /// Messages with pieces still missing.
    pub fn pending(&self) -> usize {
        self.partial.lock().len()
    }
}
