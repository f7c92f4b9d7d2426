//! Typed active messages
//!
//! Every protocol message has a struct here that knows its argument layout.
//! Handlers only ever see these types; raw `Message`s exist only between
//! `into_message` and `from_message`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::dispatch::FunctionId;
use super::handle::Token;
use super::transport::{Args, Message, MessageTag, NodeId};
use crate::runtime::directory::{RegionKey, Version};
use crate::runtime::scheduler::{CopyData, CopyFlags, DimensionTable, RegionDimension, WdId};

/// Errors raised while decoding a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{tag:?} is missing argument {index}")]
    MissingArgument { tag: MessageTag, index: usize },
    #[error("{tag:?} payload is truncated")]
    Truncated { tag: MessageTag },
    #[error("{tag:?} carries no completion token")]
    MissingToken { tag: MessageTag },
    #[error("{tag:?} is not a long message")]
    NotLong { tag: MessageTag },
    #[error("hostname is not valid UTF-8")]
    BadUtf8,
}

/// Argument reader bound to one message.
struct ArgReader<'a> {
    msg: &'a Message,
}

impl ArgReader<'_> {
    fn get(
        &self,
        index: usize,
    ) -> Result<u64, DecodeError> {
        self.msg
            .args
            .get(index)
            .copied()
            .ok_or(DecodeError::MissingArgument {
                tag: self.msg.tag,
                index,
            })
    }

    fn token(
        &self,
        index: usize,
    ) -> Result<Token, DecodeError> {
        Token::decode(self.get(index)?).ok_or(DecodeError::MissingToken { tag: self.msg.tag })
    }

    fn opt_token(
        &self,
        index: usize,
    ) -> Result<Option<Token>, DecodeError> {
        Ok(Token::decode(self.get(index)?))
    }

    fn landing(&self) -> Result<u64, DecodeError> {
        self.msg.landing.ok_or(DecodeError::NotLong { tag: self.msg.tag })
    }
}

/// Row geometry of a one-dimensional strided transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stride {
    /// Bytes per row
    pub size: u64,
    pub count: u64,
    /// Distance between rows
    pub ld: u64,
}

impl Stride {
    /// Packed length.
    #[inline]
    pub fn packed_len(&self) -> u64 {
        self.size * self.count
    }
}

/// One chunk of a PUT. The payload lands in a temporary buffer on the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutChunk {
    pub seq: u64,
    /// Final address of the data on the destination
    pub dest_addr: u64,
    /// Offset of this chunk in the (packed) transfer
    pub offset: u64,
    pub total_len: u64,
    pub last: bool,
    /// Sent by a node relaying on behalf of the master
    pub relay: bool,
    /// Task on the master the data belongs to
    pub wd_id: WdId,
    /// Completion callback on the master
    pub functor: Option<Token>,
    pub region: RegionKey,
    pub version: Version,
    pub stride: Option<Stride>,
    pub data: Bytes,
    /// Where the chunk lands: temporary buffer base plus `offset`
    pub landing: u64,
}

impl PutChunk {
    /// Base of the temporary buffer the transfer lands in.
    #[inline]
    pub fn tmp_base(&self) -> u64 {
        self.landing - self.offset
    }
}

/// Request to stream memory back to the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub seq: u64,
    /// Where the replies land on the requester
    pub origin_addr: u64,
    /// What to read on the serving node
    pub remote_addr: u64,
    /// Contiguous length, or bytes per row when strided
    pub len: u64,
    pub stride: Option<Stride>,
    pub completion: Token,
    pub copy: CopyData,
    pub dims: DimensionTable,
}

/// One chunk of a GET reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyChunk {
    pub completion: Token,
    pub offset: u64,
    pub total_len: u64,
    pub last: bool,
    /// Version of the region on the serving node
    pub version: Version,
    pub strided: bool,
    pub data: Bytes,
    pub landing: u64,
}

/// Master asks a source node to push data to a third node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayRequest {
    /// Address of the data on the source
    pub origin_addr: u64,
    pub dest: NodeId,
    pub dest_addr: u64,
    /// Temporary buffer the master reserved in the destination segment
    pub tmp_addr: u64,
    pub len: u64,
    pub stride: Option<Stride>,
    pub wd_id: WdId,
    pub functor: Option<Token>,
    pub region: RegionKey,
    pub version: Version,
}

/// Encoded work message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkHeader {
    pub entry: FunctionId,
    pub translate: Option<FunctionId>,
    /// Completion handle on the origin
    pub completion: Token,
    /// Input bytes that must arrive before the task may run
    pub expected_data: u64,
    /// Size of the whole serialized work
    pub total_size: u64,
    /// Size of the captured arguments
    pub data_size: u64,
    pub wd_id: WdId,
    /// Raw architecture tag
    pub arch: u64,
    pub seq: u64,
    /// Final piece of the serialized work
    pub piece: Bytes,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveMessage {
    Finalize,
    FinalizeReply,
    Work(WorkHeader),
    WorkDone {
        token: Token,
        pe: u64,
    },
    Malloc {
        size: u64,
        waiter: Token,
    },
    MallocReply {
        addr: u64,
        waiter: Token,
    },
    MasterHostname(String),
    Put(PutChunk),
    Get(GetRequest),
    GetReply(ReplyChunk),
    PutFill {
        addr: u64,
        len: u64,
        word_size: u64,
        value: u64,
    },
    RequestPut(RelayRequest),
    WorkData {
        wd_id: WdId,
        index: u64,
        total_len: u64,
        data: Bytes,
    },
    Free {
        addr: u64,
    },
    Realloc {
        old_addr: u64,
        old_size: u64,
        new_addr: u64,
        new_size: u64,
    },
    WaitRequestPut {
        addr: u64,
        wd_id: WdId,
        seq: u64,
    },
    /// The destination finished a PUT and hands its buffer back.
    FreeTmpBuffer {
        addr: u64,
        wd_id: WdId,
        functor: Option<Token>,
        /// Region now held by the destination, at `version`
        region: RegionKey,
        version: Version,
    },
    RegionMetadata {
        seq: u64,
        version: Version,
        holder: NodeId,
        copy: CopyData,
        dims: DimensionTable,
    },
    SynchronizeDirectory {
        token: Token,
        /// Regions and versions the replier holds; empty in the request
        regions: Option<Vec<(RegionKey, Version)>>,
    },
}

const PUT_LAST: u64 = 1;
const PUT_RELAY: u64 = 2;

fn put_flags(
    last: bool,
    relay: bool,
) -> u64 {
    (if last { PUT_LAST } else { 0 }) | (if relay { PUT_RELAY } else { 0 })
}

fn opt_stride(stride: Option<Stride>) -> [u64; 3] {
    stride.map_or([0; 3], |s| [s.size, s.count, s.ld])
}

fn read_stride(
    r: &ArgReader<'_>,
    first: usize,
) -> Result<Stride, DecodeError> {
    Ok(Stride {
        size: r.get(first)?,
        count: r.get(first + 1)?,
        ld: r.get(first + 2)?,
    })
}

impl ActiveMessage {
    /// Tag this message travels under.
    pub fn tag(&self) -> MessageTag {
        match self {
            ActiveMessage::Finalize => MessageTag::Finalize,
            ActiveMessage::FinalizeReply => MessageTag::FinalizeReply,
            ActiveMessage::Work(_) => MessageTag::Work,
            ActiveMessage::WorkDone { .. } => MessageTag::WorkDone,
            ActiveMessage::Malloc { .. } => MessageTag::Malloc,
            ActiveMessage::MallocReply { .. } => MessageTag::MallocReply,
            ActiveMessage::MasterHostname(_) => MessageTag::MasterHostname,
            ActiveMessage::Put(chunk) if chunk.stride.is_some() => MessageTag::PutStrided,
            ActiveMessage::Put(_) => MessageTag::Put,
            ActiveMessage::Get(req) if req.stride.is_some() => MessageTag::GetStrided,
            ActiveMessage::Get(_) => MessageTag::Get,
            ActiveMessage::GetReply(chunk) if chunk.strided => MessageTag::GetReplyStrided,
            ActiveMessage::GetReply(_) => MessageTag::GetReply,
            ActiveMessage::PutFill { .. } => MessageTag::PutFill,
            ActiveMessage::RequestPut(req) if req.stride.is_some() => MessageTag::RequestPutStrided,
            ActiveMessage::RequestPut(_) => MessageTag::RequestPut,
            ActiveMessage::WorkData { .. } => MessageTag::WorkData,
            ActiveMessage::Free { .. } => MessageTag::Free,
            ActiveMessage::Realloc { .. } => MessageTag::Realloc,
            ActiveMessage::WaitRequestPut { .. } => MessageTag::WaitRequestPut,
            ActiveMessage::FreeTmpBuffer { .. } => MessageTag::FreeTmpBuffer,
            ActiveMessage::RegionMetadata { .. } => MessageTag::RegionMetadata,
            ActiveMessage::SynchronizeDirectory { .. } => MessageTag::SynchronizeDirectory,
        }
    }

    /// Lower to a transport message.
    pub fn into_message(self) -> Message {
        let tag = self.tag();
        match self {
            ActiveMessage::Finalize | ActiveMessage::FinalizeReply => Message::short(tag, Args::new()),
            ActiveMessage::Work(h) => Message::medium(
                tag,
                [
                    h.entry.0,
                    h.translate.map_or(0, |t| t.0),
                    h.completion.get(),
                    h.expected_data,
                    h.total_size,
                    h.data_size,
                    h.wd_id.inner(),
                    h.arch,
                    h.seq,
                ],
                h.piece,
            ),
            ActiveMessage::WorkDone { token, pe } => Message::short(tag, [token.get(), pe]),
            ActiveMessage::Malloc { size, waiter } => Message::short(tag, [size, waiter.get()]),
            ActiveMessage::MallocReply { addr, waiter } => Message::short(tag, [addr, waiter.get()]),
            ActiveMessage::MasterHostname(name) => Message::medium(tag, Args::new(), Bytes::from(name)),
            ActiveMessage::Put(c) => {
                let mut args = vec![
                    c.seq,
                    c.dest_addr,
                    c.offset,
                    c.total_len,
                    put_flags(c.last, c.relay),
                    c.wd_id.inner(),
                    Token::encode(c.functor),
                    c.region.host_object,
                    c.region.region_id,
                    c.version,
                ];
                if c.stride.is_some() {
                    args.extend(opt_stride(c.stride));
                }
                Message::long(tag, args, c.data, c.landing)
            },
            ActiveMessage::Get(req) => {
                let mut payload = BytesMut::new();
                encode_copy(&mut payload, &req.copy, &req.dims);
                let [size, count, ld] = opt_stride(req.stride);
                Message::medium(
                    tag,
                    [
                        req.seq,
                        req.origin_addr,
                        req.remote_addr,
                        req.len,
                        req.completion.get(),
                        size,
                        count,
                        ld,
                    ],
                    payload.freeze(),
                )
            },
            ActiveMessage::GetReply(c) => Message::long(
                tag,
                [c.completion.get(), c.offset, c.total_len, c.last as u64, c.version],
                c.data,
                c.landing,
            ),
            ActiveMessage::PutFill {
                addr,
                len,
                word_size,
                value,
            } => Message::short(tag, [addr, len, word_size, value]),
            ActiveMessage::RequestPut(r) => {
                let mut args = vec![
                    r.origin_addr,
                    r.dest.0 as u64,
                    r.dest_addr,
                    r.tmp_addr,
                    r.len,
                    r.wd_id.inner(),
                    Token::encode(r.functor),
                    r.region.host_object,
                    r.region.region_id,
                    r.version,
                ];
                if r.stride.is_some() {
                    args.extend(opt_stride(r.stride));
                }
                Message::short(tag, args)
            },
            ActiveMessage::WorkData {
                wd_id,
                index,
                total_len,
                data,
            } => Message::medium(tag, [wd_id.inner(), index, total_len], data),
            ActiveMessage::Free { addr } => Message::short(tag, [addr]),
            ActiveMessage::Realloc {
                old_addr,
                old_size,
                new_addr,
                new_size,
            } => Message::short(tag, [old_addr, old_size, new_addr, new_size]),
            ActiveMessage::WaitRequestPut { addr, wd_id, seq } => {
                Message::short(tag, [addr, wd_id.inner(), seq])
            },
            ActiveMessage::FreeTmpBuffer {
                addr,
                wd_id,
                functor,
                region,
                version,
            } => Message::short(
                tag,
                [
                    addr,
                    wd_id.inner(),
                    Token::encode(functor),
                    region.host_object,
                    region.region_id,
                    version,
                ],
            ),
            ActiveMessage::RegionMetadata {
                seq,
                version,
                holder,
                copy,
                dims,
            } => {
                let mut payload = BytesMut::new();
                encode_copy(&mut payload, &copy, &dims);
                Message::medium(tag, [seq, version, holder.0 as u64], payload.freeze())
            },
            ActiveMessage::SynchronizeDirectory { token, regions } => {
                let Some(regions) = regions else {
                    return Message::short(tag, [token.get(), 0]);
                };
                let mut payload = BytesMut::with_capacity(regions.len() * 24);
                for (key, version) in &regions {
                    payload.put_u64_le(key.host_object);
                    payload.put_u64_le(key.region_id);
                    payload.put_u64_le(*version);
                }
                Message::medium(tag, [token.get(), 1], payload.freeze())
            },
        }
    }

    /// Parse a transport message.
    pub fn from_message(msg: &Message) -> Result<Self, DecodeError> {
        let r = ArgReader { msg };
        let tag = msg.tag;
        let decoded = match tag {
            MessageTag::Finalize => ActiveMessage::Finalize,
            MessageTag::FinalizeReply => ActiveMessage::FinalizeReply,
            MessageTag::Work => ActiveMessage::Work(WorkHeader {
                entry: FunctionId(r.get(0)?),
                translate: match r.get(1)? {
                    0 => None,
                    id => Some(FunctionId(id)),
                },
                completion: r.token(2)?,
                expected_data: r.get(3)?,
                total_size: r.get(4)?,
                data_size: r.get(5)?,
                wd_id: WdId(r.get(6)?),
                arch: r.get(7)?,
                seq: r.get(8)?,
                piece: msg.payload.clone(),
            }),
            MessageTag::WorkDone => ActiveMessage::WorkDone {
                token: r.token(0)?,
                pe: r.get(1)?,
            },
            MessageTag::Malloc => ActiveMessage::Malloc {
                size: r.get(0)?,
                waiter: r.token(1)?,
            },
            MessageTag::MallocReply => ActiveMessage::MallocReply {
                addr: r.get(0)?,
                waiter: r.token(1)?,
            },
            MessageTag::MasterHostname => ActiveMessage::MasterHostname(
                String::from_utf8(msg.payload.to_vec()).map_err(|_| DecodeError::BadUtf8)?,
            ),
            MessageTag::Put | MessageTag::PutStrided => ActiveMessage::Put(PutChunk {
                seq: r.get(0)?,
                dest_addr: r.get(1)?,
                offset: r.get(2)?,
                total_len: r.get(3)?,
                last: r.get(4)? & PUT_LAST != 0,
                relay: r.get(4)? & PUT_RELAY != 0,
                wd_id: WdId(r.get(5)?),
                functor: r.opt_token(6)?,
                region: RegionKey::new(r.get(7)?, r.get(8)?),
                version: r.get(9)?,
                stride: if tag == MessageTag::PutStrided {
                    Some(read_stride(&r, 10)?)
                } else {
                    None
                },
                data: msg.payload.clone(),
                landing: r.landing()?,
            }),
            MessageTag::Get | MessageTag::GetStrided => {
                let mut payload = msg.payload.clone();
                let (copy, dims) = decode_copy(&mut payload).ok_or(DecodeError::Truncated { tag })?;
                ActiveMessage::Get(GetRequest {
                    seq: r.get(0)?,
                    origin_addr: r.get(1)?,
                    remote_addr: r.get(2)?,
                    len: r.get(3)?,
                    completion: r.token(4)?,
                    stride: if tag == MessageTag::GetStrided {
                        Some(read_stride(&r, 5)?)
                    } else {
                        None
                    },
                    copy,
                    dims,
                })
            },
            MessageTag::GetReply | MessageTag::GetReplyStrided => ActiveMessage::GetReply(ReplyChunk {
                completion: r.token(0)?,
                offset: r.get(1)?,
                total_len: r.get(2)?,
                last: r.get(3)? != 0,
                version: r.get(4)?,
                strided: tag == MessageTag::GetReplyStrided,
                data: msg.payload.clone(),
                landing: r.landing()?,
            }),
            MessageTag::PutFill => ActiveMessage::PutFill {
                addr: r.get(0)?,
                len: r.get(1)?,
                word_size: r.get(2)?,
                value: r.get(3)?,
            },
            MessageTag::RequestPut | MessageTag::RequestPutStrided => ActiveMessage::RequestPut(RelayRequest {
                origin_addr: r.get(0)?,
                dest: NodeId(r.get(1)? as u32),
                dest_addr: r.get(2)?,
                tmp_addr: r.get(3)?,
                len: r.get(4)?,
                wd_id: WdId(r.get(5)?),
                functor: r.opt_token(6)?,
                region: RegionKey::new(r.get(7)?, r.get(8)?),
                version: r.get(9)?,
                stride: if tag == MessageTag::RequestPutStrided {
                    Some(read_stride(&r, 10)?)
                } else {
                    None
                },
            }),
            MessageTag::WorkData => ActiveMessage::WorkData {
                wd_id: WdId(r.get(0)?),
                index: r.get(1)?,
                total_len: r.get(2)?,
                data: msg.payload.clone(),
            },
            MessageTag::Free => ActiveMessage::Free { addr: r.get(0)? },
            MessageTag::Realloc => ActiveMessage::Realloc {
                old_addr: r.get(0)?,
                old_size: r.get(1)?,
                new_addr: r.get(2)?,
                new_size: r.get(3)?,
            },
            MessageTag::WaitRequestPut => ActiveMessage::WaitRequestPut {
                addr: r.get(0)?,
                wd_id: WdId(r.get(1)?),
                seq: r.get(2)?,
            },
            MessageTag::FreeTmpBuffer => ActiveMessage::FreeTmpBuffer {
                addr: r.get(0)?,
                wd_id: WdId(r.get(1)?),
                functor: r.opt_token(2)?,
                region: RegionKey::new(r.get(3)?, r.get(4)?),
                version: r.get(5)?,
            },
            MessageTag::RegionMetadata => {
                let mut payload = msg.payload.clone();
                let (copy, dims) = decode_copy(&mut payload).ok_or(DecodeError::Truncated { tag })?;
                ActiveMessage::RegionMetadata {
                    seq: r.get(0)?,
                    version: r.get(1)?,
                    holder: NodeId(r.get(2)? as u32),
                    copy,
                    dims,
                }
            },
            MessageTag::SynchronizeDirectory => {
                let token = r.token(0)?;
                let regions = if r.get(1)? == 0 {
                    None
                } else {
                    let mut payload = msg.payload.clone();
                    if payload.len() % 24 != 0 {
                        return Err(DecodeError::Truncated { tag });
                    }
                    let mut regions = Vec::with_capacity(payload.len() / 24);
                    while payload.has_remaining() {
                        let key = RegionKey::new(payload.get_u64_le(), payload.get_u64_le());
                        regions.push((key, payload.get_u64_le()));
                    }
                    Some(regions)
                };
                ActiveMessage::SynchronizeDirectory { token, regions }
            },
        };
        Ok(decoded)
    }
}

/// Bytes taken by one copy descriptor in a work payload.
pub const COPY_WIRE_SIZE: usize = 6 * 8;

/// Bytes taken by one region dimension.
pub const DIM_WIRE_SIZE: usize = 3 * 8;

/// Append a copy descriptor whose dimension range points into a shared table.
pub fn put_copy(
    buf: &mut BytesMut,
    copy: &CopyData,
) {
    buf.put_u64_le(copy.address);
    buf.put_u64_le(copy.flags.bits() as u64);
    buf.put_u64_le(copy.dims.offset as u64);
    buf.put_u64_le(copy.dims.count as u64);
    buf.put_u64_le(copy.host_base_address);
    buf.put_u64_le(copy.host_region_id);
}

/// Read a copy descriptor written by `put_copy`.
pub fn get_copy(buf: &mut Bytes) -> Option<CopyData> {
    if buf.remaining() < COPY_WIRE_SIZE {
        return None;
    }
    let address = buf.get_u64_le();
    let flags = CopyFlags::from_bits(buf.get_u64_le() as u8);
    let offset = buf.get_u64_le() as u32;
    let count = buf.get_u64_le() as u32;
    Some(CopyData {
        address,
        flags,
        dims: crate::runtime::scheduler::DimRange { offset, count },
        host_base_address: buf.get_u64_le(),
        host_region_id: buf.get_u64_le(),
    })
}

pub fn put_dim(
    buf: &mut BytesMut,
    dim: &RegionDimension,
) {
    buf.put_u64_le(dim.size);
    buf.put_u64_le(dim.accessed_length);
    buf.put_u64_le(dim.lower_bound);
}

pub fn get_dim(buf: &mut Bytes) -> Option<RegionDimension> {
    if buf.remaining() < DIM_WIRE_SIZE {
        return None;
    }
    Some(RegionDimension {
        size: buf.get_u64_le(),
        accessed_length: buf.get_u64_le(),
        lower_bound: buf.get_u64_le(),
    })
}

/// A standalone copy: the descriptor followed by its own dimensions.
fn encode_copy(
    buf: &mut BytesMut,
    copy: &CopyData,
    table: &DimensionTable,
) {
    let dims = table.get(copy.dims).unwrap_or(&[]);
    let mut local = *copy;
    local.dims = crate::runtime::scheduler::DimRange {
        offset: 0,
        count: dims.len() as u32,
    };
    put_copy(buf, &local);
    for dim in dims {
        put_dim(buf, dim);
    }
}

fn decode_copy(buf: &mut Bytes) -> Option<(CopyData, DimensionTable)> {
    let copy = get_copy(buf)?;
    let dims = (0..copy.dims.count)
        .map(|_| get_dim(buf))
        .collect::<Option<Vec<_>>>()?;
    Some((copy, DimensionTable::from(dims)))
}
