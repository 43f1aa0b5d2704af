//! Message transports.
//!
//! A transport is bound to one endpoint and knows how to move a message to
//! its peer: the first message of a (key, direction) pair goes through the
//! two-sided rendezvous handshake, after which the sender holds the remote
//! landing address and every further message is a single signaled
//! RDMA_WRITE_WITH_IMM. Push-request values ride an additional unsignaled
//! write placed on the page boundary after the metadata, so exactly one
//! completion fires per logical message.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use rdma_sys::*;

use crate::addrpool::AddressPool;
use crate::encoding::{align_ceil, write_rendezvous_reply, write_rendezvous_start, RendezvousReply, RendezvousStart, RENDEZVOUS_REPLY_SIZE, RENDEZVOUS_START_SIZE};
use crate::endpoint::Endpoint;
use crate::mempool::{page_size, Mempool};
use crate::message::{Message, Segment, MAX_DATA_FIELDS};
use crate::{IMM_RENDEZVOUS_REPLY, IMM_RENDEZVOUS_START, MAX_META_BOUND};

/// Cached remote landing of a (key, direction) pair:
/// `(remote_addr, rkey, address-pool idx)`.
pub type RemoteTuple = (u64, u32, u32);

/// Outbound per-message state, alive from send until the signaled write
/// completes. It crosses threads as a raw pointer: its address is the
/// rendezvous correlation token (`origin_addr`) and is stashed in the write
/// context's chunk for the completion handler.
pub struct MessageBuffer {
    /// Packed metadata, allocated from the send mempool.
    pub inline_buf: *mut u8,
    pub inline_len: usize,
    /// The message's data fields, kept alive until completion.
    pub data: Vec<Segment>,
    /// Per-field registration handles captured by `prepare_data`; empty
    /// except for push requests.
    pub mrs: Vec<(Option<MrPtr>, usize)>,
}

unsafe impl Send for MessageBuffer {}

/// Inbound per-message state: where a rendezvous reserved its landing area.
pub struct BufferContext {
    pub buffer: *mut u8,
    pub meta_len: usize,
    pub data_num: usize,
    pub data_len: [usize; MAX_DATA_FIELDS],
    /// Address-pool slot this context occupies.
    pub idx: u32,
}

unsafe impl Send for BufferContext {}

/// Send-safe wrapper for `ibv_mr` pointers.
#[derive(Clone, Copy)]
pub struct MrPtr(pub *mut ibv_mr);

unsafe impl Send for MrPtr {}
unsafe impl Sync for MrPtr {}

/// Non-owning endpoint reference; endpoints outlive their transports by
/// shutdown order (pollers join before the endpoint arena drops).
#[derive(Clone, Copy)]
pub struct EndpointRef(pub *const Endpoint);

unsafe impl Send for EndpointRef {}
unsafe impl Sync for EndpointRef {}

/// Point-to-point sender/receiver bound to one endpoint.
pub trait Transport: Send + Sync {
    fn register_memory(&self, msg: &Message);
    fn add_meta(&self, msg: &mut Message);
    fn prepare_data(&self, msg: &Message, buf: &mut MessageBuffer);

    fn send_rendezvous_begin(&self, msg: &Message, buf: *mut MessageBuffer);
    fn send_rendezvous_reply(&self, req: RendezvousStart, pool: &AddressPool<BufferContext>);
    fn write_with_imm(&self, buf: *mut MessageBuffer, remote_addr: u64, rkey: u32, idx: u32);

    fn send_push_request(&self, msg: &Message, buf: *mut MessageBuffer, remote: RemoteTuple);
    fn send_push_response(&self, msg: &Message, buf: *mut MessageBuffer, remote: RemoteTuple);
    fn send_pull_request(&self, msg: &Message, buf: *mut MessageBuffer, remote: RemoteTuple);
    fn send_pull_response(&self, msg: &Message, buf: *mut MessageBuffer, remote: RemoteTuple);

    fn recv_push_request(&self, msg: &mut Message, ctx: &BufferContext, meta_len: usize) -> usize;
    fn recv_pull_request(&self, msg: &mut Message, ctx: &BufferContext, meta_len: usize) -> usize;
    fn recv_push_response(&self, msg: &mut Message, ctx: &BufferContext, meta_len: usize) -> usize;
    fn recv_pull_response(&self, msg: &mut Message, ctx: &BufferContext, meta_len: usize) -> usize;
}

/// Reads the single u64 key from a keys data field.
pub fn decode_key(keys: &Segment) -> u64 {
    let s = keys.as_slice();
    assert!(s.len() >= 8, "keys field shorter than one key");
    u64::from_le_bytes(s[..8].try_into().unwrap())
}

/// The one-sided RDMA transport.
pub struct RdmaTransport {
    endpoint: EndpointRef,
    send_pool: Arc<Mempool>,
    recv_pool: Arc<Mempool>,
    page: usize,
    is_server: bool,
    /// Registered application buffers, keyed by base address. Registrations
    /// live for the lifetime of the transport.
    mem_mr: Mutex<HashMap<u64, MrPtr>>,
}

unsafe impl Send for RdmaTransport {}
unsafe impl Sync for RdmaTransport {}

impl RdmaTransport {
    pub fn new(
        endpoint: *const Endpoint,
        send_pool: Arc<Mempool>,
        recv_pool: Arc<Mempool>,
        is_server: bool,
    ) -> Self {
        Self {
            endpoint: EndpointRef(endpoint),
            send_pool,
            recv_pool,
            page: page_size(),
            is_server,
            mem_mr: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    fn ep(&self) -> &Endpoint {
        unsafe { &*self.endpoint.0 }
    }

    fn post_send(&self, wr: &mut ibv_send_wr) {
        let mut bad_wr: *mut ibv_send_wr = std::ptr::null_mut();
        let rc = unsafe { ibv_post_send(self.ep().qp(), wr, &mut bad_wr) };
        assert_eq!(rc, 0, "ibv_post_send failed: {}", io::Error::last_os_error());
    }
}

impl Transport for RdmaTransport {
    fn register_memory(&self, msg: &Message) {
        for seg in &msg.data {
            if seg.is_empty() {
                continue;
            }
            let base = seg.as_ptr() as u64;
            let mut map = self.mem_mr.lock().unwrap();
            if map.contains_key(&base) {
                continue;
            }
            let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
                | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
            let mr = unsafe {
                ibv_reg_mr(
                    self.send_pool.pd(),
                    seg.as_ptr() as *mut libc::c_void,
                    seg.len(),
                    access as i32,
                )
            };
            assert!(
                !mr.is_null(),
                "failed to register data field ({} bytes): {}",
                seg.len(),
                io::Error::last_os_error()
            );
            map.insert(base, MrPtr(mr));
        }
    }

    fn add_meta(&self, msg: &mut Message) {
        if msg.meta.request {
            msg.meta.key = decode_key(&msg.data[0]);
        }
        if msg.meta.push && msg.meta.request {
            // push request: advertise the value buffer for the server's
            // tensor registry
            assert_eq!(msg.data.len(), 3, "push request must carry keys/vals/lens");
            let vals = &msg.data[1];
            if vals.is_empty() {
                msg.meta.addr = 0;
                msg.meta.val_len = 0;
                msg.meta.option = 0;
            } else {
                let map = self.mem_mr.lock().unwrap();
                let mr = map
                    .get(&(vals.as_ptr() as u64))
                    .expect("push request values are not registered");
                msg.meta.addr = vals.as_ptr() as u64;
                msg.meta.val_len = vals.len() as u32;
                msg.meta.option = unsafe { (*mr.0).rkey };
            }
        }
    }

    fn prepare_data(&self, msg: &Message, buf: &mut MessageBuffer) {
        if !(msg.meta.push && msg.meta.request) {
            return; // only push requests move payload from local buffers
        }
        let map = self.mem_mr.lock().unwrap();
        for seg in &buf.data {
            if seg.is_empty() {
                buf.mrs.push((None, 0));
                continue;
            }
            let mr = *map
                .get(&(seg.as_ptr() as u64))
                .expect("push request field is not registered");
            buf.mrs.push((Some(mr), seg.len()));
        }
    }

    fn send_rendezvous_begin(&self, msg: &Message, buf: *mut MessageBuffer) {
        let ctx = self.ep().pick_start_ctx();
        unsafe {
            let chunk = (*(*ctx).mr).addr as *mut u8;
            let mut req = RendezvousStart {
                meta_len: (*buf).inline_len as u64,
                data_num: msg.data.len() as u64,
                data_len: [0; MAX_DATA_FIELDS],
                origin_addr: buf as u64,
            };
            for (i, seg) in msg.data.iter().enumerate() {
                req.data_len[i] = seg.len() as u64;
            }
            write_rendezvous_start(chunk, &req);

            let mut sge: ibv_sge = std::mem::zeroed();
            sge.addr = chunk as u64;
            sge.length = RENDEZVOUS_START_SIZE as u32;
            sge.lkey = (*(*ctx).mr).lkey;

            let mut wr: ibv_send_wr = std::mem::zeroed();
            wr.wr_id = ctx as u64;
            wr.opcode = ibv_wr_opcode::IBV_WR_SEND_WITH_IMM;
            wr.imm_data_invalidated_rkey_union.imm_data = IMM_RENDEZVOUS_START;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;

            self.post_send(&mut wr);
        }
    }

    fn send_rendezvous_reply(&self, req: RendezvousStart, pool: &AddressPool<BufferContext>) {
        let data_total: u64 = req.data_len.iter().sum();
        // A worker only ever lands metadata here: pull-response values go
        // straight into its registered tensor memory.
        let alloc_len = if self.is_server {
            MAX_META_BOUND as u64 + req.meta_len + data_total
        } else {
            MAX_META_BOUND as u64 + req.meta_len
        };
        let buffer = self.recv_pool.alloc(alloc_len as usize);

        let mut data_len = [0usize; MAX_DATA_FIELDS];
        for (slot, len) in data_len.iter_mut().zip(req.data_len) {
            *slot = len as usize;
        }
        let buf_ctx = Box::into_raw(Box::new(BufferContext {
            buffer,
            meta_len: req.meta_len as usize,
            data_num: req.data_num as usize,
            data_len,
            idx: 0,
        }));
        let idx = pool.store(buf_ctx);
        unsafe {
            (*buf_ctx).idx = idx;
        }

        let ctx = self.ep().pick_reply_ctx();
        unsafe {
            let chunk = (*(*ctx).mr).addr as *mut u8;
            write_rendezvous_reply(
                chunk,
                &RendezvousReply {
                    addr: buffer as u64,
                    origin_addr: req.origin_addr,
                    rkey: self.recv_pool.remote_key(buffer),
                    idx,
                },
            );

            let mut sge: ibv_sge = std::mem::zeroed();
            sge.addr = chunk as u64;
            sge.length = RENDEZVOUS_REPLY_SIZE as u32;
            sge.lkey = (*(*ctx).mr).lkey;

            let mut wr: ibv_send_wr = std::mem::zeroed();
            wr.wr_id = ctx as u64;
            wr.opcode = ibv_wr_opcode::IBV_WR_SEND_WITH_IMM;
            wr.imm_data_invalidated_rkey_union.imm_data = IMM_RENDEZVOUS_REPLY;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;

            self.post_send(&mut wr);
        }
    }

    fn write_with_imm(&self, buf: *mut MessageBuffer, remote_addr: u64, rkey: u32, idx: u32) {
        unsafe {
            let mrs = &(*buf).mrs;
            if mrs.len() == 3 {
                // push request: unsignaled value write onto the page boundary
                // after the metadata
                let (mr, len) = &mrs[1];
                if let (Some(mr), len @ 1..) = (mr, *len) {
                    let mut sge: ibv_sge = std::mem::zeroed();
                    sge.addr = (*mr.0).addr as u64;
                    sge.length = len as u32;
                    sge.lkey = (*mr.0).lkey;

                    let mut wr: ibv_send_wr = std::mem::zeroed();
                    wr.wr_id = 0;
                    wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
                    wr.sg_list = &mut sge;
                    wr.num_sge = 1;
                    wr.wr.rdma.remote_addr =
                        remote_addr + align_ceil((*buf).inline_len, self.page) as u64;
                    wr.wr.rdma.rkey = rkey;

                    self.post_send(&mut wr);
                }
            } else {
                assert!(mrs.is_empty(), "unexpected prepared field count");
            }

            // signaled metadata write; the immediate names the landing slot
            let ctx = self.ep().pick_write_ctx();
            let scratch = (*(*ctx).mr).addr as *mut u64;
            *scratch = buf as u64;

            let mut sge: ibv_sge = std::mem::zeroed();
            sge.addr = (*buf).inline_buf as u64;
            sge.length = (*buf).inline_len as u32;
            sge.lkey = self.send_pool.local_key((*buf).inline_buf);

            let mut wr: ibv_send_wr = std::mem::zeroed();
            wr.wr_id = ctx as u64;
            wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM;
            wr.imm_data_invalidated_rkey_union.imm_data = idx;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.wr.rdma.remote_addr = remote_addr;
            wr.wr.rdma.rkey = rkey;

            self.post_send(&mut wr);
        }
    }

    fn send_push_request(&self, _msg: &Message, buf: *mut MessageBuffer, remote: RemoteTuple) {
        self.write_with_imm(buf, remote.0, remote.1, remote.2);
    }

    fn send_push_response(&self, _msg: &Message, buf: *mut MessageBuffer, remote: RemoteTuple) {
        self.write_with_imm(buf, remote.0, remote.1, remote.2);
    }

    fn send_pull_request(&self, _msg: &Message, buf: *mut MessageBuffer, remote: RemoteTuple) {
        self.write_with_imm(buf, remote.0, remote.1, remote.2);
    }

    fn send_pull_response(&self, msg: &Message, buf: *mut MessageBuffer, remote: RemoteTuple) {
        // values go to the address the worker advertised on its push;
        // unsignaled, ordered before the meta write by the queue pair
        let raddr = msg.meta.addr;
        let rkey = msg.meta.option;
        let vals = &msg.data[1];

        if !vals.is_empty() {
            let map = self.mem_mr.lock().unwrap();
            let mr = *map
                .get(&(vals.as_ptr() as u64))
                .expect("pull response values are not registered");
            drop(map);

            unsafe {
                let mut sge: ibv_sge = std::mem::zeroed();
                sge.addr = vals.as_ptr() as u64;
                sge.length = vals.len() as u32;
                sge.lkey = (*mr.0).lkey;

                let mut wr: ibv_send_wr = std::mem::zeroed();
                wr.wr_id = 0;
                wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
                wr.sg_list = &mut sge;
                wr.num_sge = 1;
                wr.wr.rdma.remote_addr = raddr;
                wr.wr.rdma.rkey = rkey;

                self.post_send(&mut wr);
            }
        }

        self.write_with_imm(buf, remote.0, remote.1, remote.2);
    }

    fn recv_push_request(&self, msg: &mut Message, ctx: &BufferContext, meta_len: usize) -> usize {
        assert!(msg.meta.push && msg.meta.request);
        assert_eq!(ctx.data_num, 3);
        let len = ctx.data_len[1];
        let cur = unsafe { ctx.buffer.add(align_ceil(meta_len, self.page)) };

        let keys = Segment::copy_of(&msg.meta.key.to_le_bytes());
        let vals = unsafe { Segment::view(cur, len) };
        let lens = Segment::copy_of(&(msg.meta.val_len as i32).to_le_bytes());

        let total = keys.len() + vals.len() + lens.len();
        msg.data = vec![keys, vals, lens];
        total
    }

    fn recv_pull_request(&self, msg: &mut Message, _ctx: &BufferContext, _meta_len: usize) -> usize {
        let keys = Segment::copy_of(&msg.meta.key.to_le_bytes());
        let vals = Segment::from_vec(Vec::new());
        let total = keys.len();
        msg.data = vec![keys, vals];
        total
    }

    fn recv_push_response(&self, _msg: &mut Message, ctx: &BufferContext, _meta_len: usize) -> usize {
        assert_eq!(ctx.data_num, 0);
        0
    }

    fn recv_pull_response(&self, msg: &mut Message, _ctx: &BufferContext, _meta_len: usize) -> usize {
        let keys = Segment::copy_of(&msg.meta.key.to_le_bytes());
        let vals = if msg.meta.val_len == 0 {
            Segment::from_vec(Vec::new())
        } else {
            unsafe {
                Segment::view(msg.meta.addr as usize as *const u8, msg.meta.val_len as usize)
            }
        };
        let lens = Segment::copy_of(&(msg.meta.val_len as i32).to_le_bytes());

        let total = keys.len() + vals.len() + lens.len();
        msg.data = vec![keys, vals, lens];
        total
    }
}

impl Drop for RdmaTransport {
    fn drop(&mut self) {
        for (_, mr) in self.mem_mr.lock().unwrap().drain() {
            unsafe {
                ibv_dereg_mr(mr.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_key_reads_first_u64() {
        let keys = Segment::copy_of(&7u64.to_le_bytes());
        assert_eq!(decode_key(&keys), 7);

        let mut long = 9u64.to_le_bytes().to_vec();
        long.extend_from_slice(&13u64.to_le_bytes());
        assert_eq!(decode_key(&Segment::from_vec(long)), 9);
    }

    #[test]
    #[should_panic(expected = "shorter than one key")]
    fn decode_key_rejects_short_field() {
        decode_key(&Segment::from_vec(vec![1, 2, 3]));
    }
}
