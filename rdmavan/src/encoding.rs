//! Fixed-layout wire encoding.
//!
//! Three things cross the wire besides raw tensor payloads:
//!
//! - packed [`Meta`] records, written into the inline segment of every
//!   message;
//! - the rendezvous pods [`RendezvousStart`] and [`RendezvousReply`],
//!   exchanged as two-sided sends before the first one-sided write of a
//!   (key, direction) pair;
//! - [`RequestContext`], carried as rdma_cm private data during connection
//!   establishment.
//!
//! All multi-byte fields are little-endian. Both peers run the same binary;
//! a cross-architecture deployment would need explicit byte-order handling.

use crate::error::{Error, Result};
use crate::message::{Command, Control, Message, Meta, Node, Role, MAX_DATA_FIELDS};

/// Rounds `v` up to a multiple of `align`.
#[inline]
pub fn align_ceil(v: usize, align: usize) -> usize {
    v.div_ceil(align) * align
}

// =============================================================================
// Rendezvous pods
// =============================================================================

/// Opens a rendezvous: tells the receiver how much landing space the message
/// needs. `origin_addr` is the sender-side address of the pending
/// MessageBuffer, echoed back in the reply to correlate the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousStart {
    pub meta_len: u64,
    pub data_num: u64,
    pub data_len: [u64; MAX_DATA_FIELDS],
    pub origin_addr: u64,
}

/// Wire size of [`RendezvousStart`].
pub const RENDEZVOUS_START_SIZE: usize = 8 * (3 + MAX_DATA_FIELDS);

/// Answers a rendezvous with the landing address, its rkey, and the
/// address-pool slot the receiver reserved for the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousReply {
    pub addr: u64,
    pub origin_addr: u64,
    pub rkey: u32,
    pub idx: u32,
}

/// Wire size of [`RendezvousReply`].
pub const RENDEZVOUS_REPLY_SIZE: usize = 8 + 8 + 4 + 4;

/// Encode a RendezvousStart at `buf`.
///
/// # Safety
/// `buf` must be valid for writes of [`RENDEZVOUS_START_SIZE`] bytes.
pub unsafe fn write_rendezvous_start(buf: *mut u8, req: &RendezvousStart) {
    let mut p = buf;
    p = put_u64(p, req.meta_len);
    p = put_u64(p, req.data_num);
    for len in req.data_len {
        p = put_u64(p, len);
    }
    put_u64(p, req.origin_addr);
}

/// Decode a RendezvousStart from `buf`.
///
/// # Safety
/// `buf` must be valid for reads of [`RENDEZVOUS_START_SIZE`] bytes.
pub unsafe fn read_rendezvous_start(buf: *const u8) -> RendezvousStart {
    let mut p = buf;
    let meta_len = get_u64(&mut p);
    let data_num = get_u64(&mut p);
    let mut data_len = [0u64; MAX_DATA_FIELDS];
    for slot in &mut data_len {
        *slot = get_u64(&mut p);
    }
    let origin_addr = get_u64(&mut p);
    RendezvousStart {
        meta_len,
        data_num,
        data_len,
        origin_addr,
    }
}

/// Encode a RendezvousReply at `buf`.
///
/// # Safety
/// `buf` must be valid for writes of [`RENDEZVOUS_REPLY_SIZE`] bytes.
pub unsafe fn write_rendezvous_reply(buf: *mut u8, resp: &RendezvousReply) {
    let mut p = buf;
    p = put_u64(p, resp.addr);
    p = put_u64(p, resp.origin_addr);
    p = put_u32(p, resp.rkey);
    put_u32(p, resp.idx);
}

/// Decode a RendezvousReply from `buf`.
///
/// # Safety
/// `buf` must be valid for reads of [`RENDEZVOUS_REPLY_SIZE`] bytes.
pub unsafe fn read_rendezvous_reply(buf: *const u8) -> RendezvousReply {
    let mut p = buf;
    let addr = get_u64(&mut p);
    let origin_addr = get_u64(&mut p);
    let rkey = get_u32(&mut p);
    let idx = get_u32(&mut p);
    RendezvousReply {
        addr,
        origin_addr,
        rkey,
        idx,
    }
}

#[inline]
unsafe fn put_u64(p: *mut u8, v: u64) -> *mut u8 {
    std::ptr::copy_nonoverlapping(v.to_le_bytes().as_ptr(), p, 8);
    p.add(8)
}

#[inline]
unsafe fn put_u32(p: *mut u8, v: u32) -> *mut u8 {
    std::ptr::copy_nonoverlapping(v.to_le_bytes().as_ptr(), p, 4);
    p.add(4)
}

#[inline]
unsafe fn get_u64(p: &mut *const u8) -> u64 {
    let mut b = [0u8; 8];
    std::ptr::copy_nonoverlapping(*p, b.as_mut_ptr(), 8);
    *p = p.add(8);
    u64::from_le_bytes(b)
}

#[inline]
unsafe fn get_u32(p: &mut *const u8) -> u32 {
    let mut b = [0u8; 4];
    std::ptr::copy_nonoverlapping(*p, b.as_mut_ptr(), 4);
    *p = p.add(4);
    u32::from_le_bytes(b)
}

// =============================================================================
// Connection-request context (rdma_cm private data)
// =============================================================================

/// Fixed number of hostname bytes carried in CM private data. Longer
/// hostnames are truncated; extending the field would break wire
/// compatibility between binaries.
pub const HOSTNAME_BYTES: usize = 16;

/// Wire size of [`RequestContext`].
pub const REQUEST_CONTEXT_SIZE: usize = 4 + 2 + HOSTNAME_BYTES;

/// Peer identity exchanged during connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub node: u32,
    pub port: u16,
    pub hostname: [u8; HOSTNAME_BYTES],
}

impl RequestContext {
    pub fn new(node: u32, port: u16, hostname: &str) -> Self {
        let bytes = hostname.as_bytes();
        if bytes.len() > HOSTNAME_BYTES {
            log::warn!(
                "hostname {} exceeds {} bytes and will be truncated in CM private data",
                hostname,
                HOSTNAME_BYTES
            );
        }
        let n = bytes.len().min(HOSTNAME_BYTES);
        let mut hostname = [0u8; HOSTNAME_BYTES];
        hostname[..n].copy_from_slice(&bytes[..n]);
        Self {
            node,
            port,
            hostname,
        }
    }

    pub fn hostname_str(&self) -> &str {
        let end = self
            .hostname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(HOSTNAME_BYTES);
        std::str::from_utf8(&self.hostname[..end]).unwrap_or("")
    }
}

pub fn encode_request_context(ctx: &RequestContext) -> [u8; REQUEST_CONTEXT_SIZE] {
    let mut buf = [0u8; REQUEST_CONTEXT_SIZE];
    buf[0..4].copy_from_slice(&ctx.node.to_le_bytes());
    buf[4..6].copy_from_slice(&ctx.port.to_le_bytes());
    buf[6..].copy_from_slice(&ctx.hostname);
    buf
}

pub fn decode_request_context(buf: &[u8]) -> Result<RequestContext> {
    if buf.len() < REQUEST_CONTEXT_SIZE {
        return Err(Error::InvalidMeta("request context too short"));
    }
    let node = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let port = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    let mut hostname = [0u8; HOSTNAME_BYTES];
    hostname.copy_from_slice(&buf[6..REQUEST_CONTEXT_SIZE]);
    Ok(RequestContext {
        node,
        port,
        hostname,
    })
}

// =============================================================================
// Packed Meta
// =============================================================================

const FLAG_REQUEST: u8 = 1 << 0;
const FLAG_PUSH: u8 = 1 << 1;
const FLAG_SIMPLE_APP: u8 = 1 << 2;

/// Exact byte length `pack_meta` will produce for `meta`.
pub fn packed_meta_len(meta: &Meta) -> usize {
    let mut len = 1 // flags
        + 4 * 4 // sender, recver, timestamp, customer_id
        + 8 + 8 // key, addr
        + 4 + 4 // val_len, option
        + 4 + meta.body.len()
        + 1 + 8 * meta.data_num as usize
        + 1 + 4 + 8 // control: cmd, barrier_group, msg_sig
        + 2; // node count
    for node in &meta.control.nodes {
        len += 4 + 1 + 2 + 2 + node.hostname.len();
    }
    len
}

/// Packs `meta` into `buf`, returning the number of bytes written.
/// `buf` must be at least [`packed_meta_len`] bytes.
pub fn pack_meta(meta: &Meta, buf: &mut [u8]) -> usize {
    let mut w = Writer { buf, pos: 0 };
    let mut flags = 0u8;
    if meta.request {
        flags |= FLAG_REQUEST;
    }
    if meta.push {
        flags |= FLAG_PUSH;
    }
    if meta.simple_app {
        flags |= FLAG_SIMPLE_APP;
    }
    w.put_u8(flags);
    w.put_i32(meta.sender);
    w.put_i32(meta.recver);
    w.put_i32(meta.timestamp);
    w.put_i32(meta.customer_id);
    w.put_u64(meta.key);
    w.put_u64(meta.addr);
    w.put_u32(meta.val_len);
    w.put_u32(meta.option);
    w.put_u32(meta.body.len() as u32);
    w.put_bytes(&meta.body);
    w.put_u8(meta.data_num);
    for i in 0..meta.data_num as usize {
        w.put_u64(meta.data_len[i]);
    }
    w.put_u8(meta.control.cmd.to_u8());
    w.put_i32(meta.control.barrier_group);
    w.put_u64(meta.control.msg_sig);
    w.put_u16(meta.control.nodes.len() as u16);
    for node in &meta.control.nodes {
        w.put_i32(node.id);
        w.put_u8(node.role.to_u8());
        w.put_u16(node.port);
        w.put_u16(node.hostname.len() as u16);
        w.put_bytes(node.hostname.as_bytes());
    }
    w.pos
}

/// Unpacks a meta record from `buf`.
pub fn unpack_meta(buf: &[u8]) -> Result<Meta> {
    let mut r = Reader { buf, pos: 0 };
    let flags = r.get_u8()?;
    let mut meta = Meta {
        request: flags & FLAG_REQUEST != 0,
        push: flags & FLAG_PUSH != 0,
        simple_app: flags & FLAG_SIMPLE_APP != 0,
        sender: r.get_i32()?,
        recver: r.get_i32()?,
        timestamp: r.get_i32()?,
        customer_id: r.get_i32()?,
        key: r.get_u64()?,
        addr: r.get_u64()?,
        val_len: r.get_u32()?,
        option: r.get_u32()?,
        ..Meta::default()
    };
    let body_len = r.get_u32()? as usize;
    meta.body = r.get_bytes(body_len)?.to_vec();
    meta.data_num = r.get_u8()?;
    if meta.data_num as usize > MAX_DATA_FIELDS {
        return Err(Error::InvalidMeta("data field count out of range"));
    }
    for i in 0..meta.data_num as usize {
        meta.data_len[i] = r.get_u64()?;
    }
    let cmd = r.get_u8()?;
    meta.control = Control {
        cmd: Command::from_u8(cmd).ok_or(Error::InvalidMeta("unknown control command"))?,
        barrier_group: r.get_i32()?,
        msg_sig: r.get_u64()?,
        nodes: Vec::new(),
    };
    let node_count = r.get_u16()? as usize;
    for _ in 0..node_count {
        let id = r.get_i32()?;
        let role =
            Role::from_u8(r.get_u8()?).ok_or(Error::InvalidMeta("unknown node role"))?;
        let port = r.get_u16()?;
        let host_len = r.get_u16()? as usize;
        let hostname = std::str::from_utf8(r.get_bytes(host_len)?)
            .map_err(|_| Error::InvalidMeta("hostname is not valid UTF-8"))?
            .to_string();
        meta.control.nodes.push(Node {
            id,
            role,
            hostname,
            port,
        });
    }
    Ok(meta)
}

/// Fills the wire data-field descriptors of `msg.meta` from its data fields.
pub fn describe_data(msg: &mut Message) {
    msg.meta.data_num = msg.data.len() as u8;
    msg.meta.data_len = [0; MAX_DATA_FIELDS];
    for (i, seg) in msg.data.iter().enumerate() {
        msg.meta.data_len[i] = seg.len() as u64;
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put_u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    fn put_u16(&mut self, v: u16) {
        self.put_bytes(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.put_bytes(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.put_bytes(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::InvalidMeta("truncated record"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_bytes(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.get_bytes(2)?.try_into().unwrap()))
    }

    fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.get_bytes(4)?.try_into().unwrap()))
    }

    fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.get_bytes(4)?.try_into().unwrap()))
    }

    fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.get_bytes(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(meta: &Meta) -> Meta {
        let mut buf = vec![0u8; packed_meta_len(meta)];
        let n = pack_meta(meta, &mut buf);
        assert_eq!(n, buf.len());
        unpack_meta(&buf).expect("unpack")
    }

    #[test]
    fn align_ceil_basics() {
        assert_eq!(align_ceil(0, 4096), 0);
        assert_eq!(align_ceil(1, 4096), 4096);
        assert_eq!(align_ceil(4096, 4096), 4096);
        assert_eq!(align_ceil(4097, 4096), 8192);
    }

    #[test]
    fn meta_roundtrip_default() {
        let meta = Meta::default();
        assert_eq!(roundtrip(&meta), meta);
    }

    #[test]
    fn meta_roundtrip_push_request() {
        let mut meta = Meta {
            sender: 9,
            recver: 8,
            timestamp: 42,
            customer_id: 1,
            request: true,
            push: true,
            key: 7,
            addr: 0xdead_beef_0000,
            val_len: 1024,
            option: 0x1234_5678,
            ..Meta::default()
        };
        meta.data_num = 3;
        meta.data_len = [8, 1024, 4, 0];
        assert_eq!(roundtrip(&meta), meta);
    }

    #[test]
    fn meta_roundtrip_control() {
        let meta = Meta {
            sender: 1,
            recver: Meta::EMPTY,
            control: Control {
                cmd: Command::AddNode,
                barrier_group: 7,
                msg_sig: 0xfeed_face,
                nodes: vec![
                    Node {
                        id: 8,
                        role: Role::Server,
                        hostname: "10.0.0.1".into(),
                        port: 9000,
                    },
                    Node {
                        id: 9,
                        role: Role::Worker,
                        hostname: "10.0.0.2".into(),
                        port: 9001,
                    },
                ],
            },
            ..Meta::default()
        };
        assert_eq!(roundtrip(&meta), meta);
        assert!(!meta.is_pushpull());
    }

    #[test]
    fn meta_roundtrip_body() {
        let meta = Meta {
            body: b"opaque app payload".to_vec(),
            simple_app: true,
            ..Meta::default()
        };
        assert_eq!(roundtrip(&meta), meta);
    }

    #[test]
    fn unpack_rejects_truncation() {
        let meta = Meta::default();
        let mut buf = vec![0u8; packed_meta_len(&meta)];
        pack_meta(&meta, &mut buf);
        for cut in [0, 1, buf.len() - 1] {
            assert!(unpack_meta(&buf[..cut]).is_err());
        }
    }

    #[test]
    fn rendezvous_start_roundtrip() {
        let req = RendezvousStart {
            meta_len: 123,
            data_num: 3,
            data_len: [8, 4096, 4, 0],
            origin_addr: 0x7f00_1234_5678,
        };
        let mut buf = [0u8; RENDEZVOUS_START_SIZE];
        unsafe {
            write_rendezvous_start(buf.as_mut_ptr(), &req);
            assert_eq!(read_rendezvous_start(buf.as_ptr()), req);
        }
    }

    #[test]
    fn rendezvous_reply_roundtrip() {
        let resp = RendezvousReply {
            addr: 0x5555_0000,
            origin_addr: 0x7f00_aaaa,
            rkey: 0xdead,
            idx: 17,
        };
        let mut buf = [0u8; RENDEZVOUS_REPLY_SIZE];
        unsafe {
            write_rendezvous_reply(buf.as_mut_ptr(), &resp);
            assert_eq!(read_rendezvous_reply(buf.as_ptr()), resp);
        }
    }

    #[test]
    fn request_context_roundtrip_and_truncation() {
        let ctx = RequestContext::new(3, 9011, "node-a");
        let decoded = decode_request_context(&encode_request_context(&ctx)).unwrap();
        assert_eq!(decoded, ctx);
        assert_eq!(decoded.hostname_str(), "node-a");

        let long = RequestContext::new(4, 1, "a-hostname-longer-than-sixteen-bytes");
        assert_eq!(long.hostname_str().len(), HOSTNAME_BYTES);

        assert!(decode_request_context(&[0u8; 4]).is_err());
    }

    #[test]
    fn describe_data_fills_descriptors() {
        use crate::message::Segment;
        let mut msg = Message::default();
        msg.data.push(Segment::from_vec(vec![0; 8]));
        msg.data.push(Segment::from_vec(vec![0; 1024]));
        msg.data.push(Segment::from_vec(vec![0; 4]));
        describe_data(&mut msg);
        assert_eq!(msg.meta.data_num, 3);
        assert_eq!(msg.meta.data_len, [8, 1024, 4, 0]);
    }
}
