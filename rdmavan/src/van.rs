//! The Van: point-to-point messaging facade.
//!
//! Owns the rdma_cm event channel and listener, the lazily-created verbs
//! context (protection domain, completion queue, mempools), the endpoint
//! table, and the two poller threads. `send_msg` routes a message to the
//! peer's transport, using the address cache to skip rendezvous in steady
//! state; `recv_msg` blocks on the buffer hand-off queue fed by the
//! completion poller.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::Rng;
use rdma_sys::*;
use socket2::SockAddr;

use crate::addrpool::AddressPool;
use crate::config::Config;
use crate::encoding::{
    self, decode_request_context, encode_request_context, read_rendezvous_reply,
    read_rendezvous_start, RendezvousReply, RequestContext, REQUEST_CONTEXT_SIZE,
};
use crate::endpoint::{ConnectionStatus, Endpoint, WrContext};
use crate::error::{Error, Result};
use crate::ipc::IpcTransport;
use crate::mempool::Mempool;
use crate::message::{Message, Meta, Node};
use crate::transport::{
    BufferContext, MessageBuffer, RdmaTransport, RemoteTuple, Transport,
};
use crate::{IMM_RENDEZVOUS_REPLY, IMM_RENDEZVOUS_START, MAX_CONCURRENT_WR};

/// rdma_cm address/route resolution timeout.
const CM_TIMEOUT_MS: i32 = 500;
/// CM event channel poll interval.
const CM_POLL_MS: i32 = 10;
/// Listen backlog on the CM listener.
const LISTEN_BACKLOG: i32 = 128;
/// Sleep between rejected connection retries.
const RETRY_SLEEP_MS: u64 = 500;
/// Source-port binding attempts when DMLC_NODE_HOST pins the interface.
const MAX_RESOLVE_RETRY: usize = 50;
/// First source port tried for pinned-interface resolution.
const BASE_PORT: u16 = 9010;

/// One received buffer handed from the CQ poller to `recv_msg`.
struct RecvNotification {
    endpoint: *const Endpoint,
    ctx: *mut BufferContext,
}

unsafe impl Send for RecvNotification {}

/// Rendezvous/address-cache state, all under one lock so a reply racing the
/// send path cannot lose an update.
#[derive(Default)]
struct AddrCaches {
    /// (key, recver) -> remote landing for push traffic.
    push_addr: HashMap<(u64, i32), RemoteTuple>,
    /// (key, recver) -> remote landing for pull traffic.
    pull_addr: HashMap<(u64, i32), RemoteTuple>,
    /// In-flight rendezvous: MessageBuffer address -> (key, is_push, recver).
    pending: HashMap<u64, (u64, bool, i32)>,
}

pub struct Van {
    config: Config,
    my_node: Mutex<Node>,
    should_stop: AtomicBool,

    event_channel: AtomicPtr<rdma_event_channel>,
    listener: AtomicPtr<rdma_cm_id>,
    context: AtomicPtr<ibv_context>,
    pd: AtomicPtr<ibv_pd>,
    comp_channel: AtomicPtr<ibv_comp_channel>,
    cq: AtomicPtr<ibv_cq>,

    send_pool: Mutex<Option<Arc<Mempool>>>,
    recv_pool: Mutex<Option<Arc<Mempool>>>,
    addr_pool: AddressPool<BufferContext>,

    endpoints: Mutex<HashMap<i32, Arc<Endpoint>>>,
    incoming: Mutex<Vec<Arc<Endpoint>>>,
    is_local: Mutex<HashMap<i32, bool>>,

    recv_tx: Mutex<Option<Sender<RecvNotification>>>,
    recv_rx: Receiver<RecvNotification>,

    cq_thread: Mutex<Option<JoinHandle<()>>>,
    cm_thread: Mutex<Option<JoinHandle<()>>>,

    caches: Mutex<AddrCaches>,
    /// Server-side registry: (key, sender) -> (val_len, addr, rkey) of the
    /// worker's tensor, fixed on first push.
    tensor_info: Mutex<HashMap<(u64, i32), (u32, u64, u32)>>,
}

unsafe impl Send for Van {}
unsafe impl Sync for Van {}

impl Van {
    pub fn new(my_node: Node, config: Config) -> Arc<Van> {
        // must precede any verbs allocation in case the application forks
        assert_eq!(unsafe { ibv_fork_init() }, 0, "ibv_fork_init failed");
        let (tx, rx) = unbounded();
        Arc::new(Van {
            config,
            my_node: Mutex::new(my_node),
            should_stop: AtomicBool::new(false),
            event_channel: AtomicPtr::new(std::ptr::null_mut()),
            listener: AtomicPtr::new(std::ptr::null_mut()),
            context: AtomicPtr::new(std::ptr::null_mut()),
            pd: AtomicPtr::new(std::ptr::null_mut()),
            comp_channel: AtomicPtr::new(std::ptr::null_mut()),
            cq: AtomicPtr::new(std::ptr::null_mut()),
            send_pool: Mutex::new(None),
            recv_pool: Mutex::new(None),
            addr_pool: AddressPool::new(),
            endpoints: Mutex::new(HashMap::new()),
            incoming: Mutex::new(Vec::new()),
            is_local: Mutex::new(HashMap::new()),
            recv_tx: Mutex::new(Some(tx)),
            recv_rx: rx,
            cq_thread: Mutex::new(None),
            cm_thread: Mutex::new(None),
            caches: Mutex::new(AddrCaches::default()),
            tensor_info: Mutex::new(HashMap::new()),
        })
    }

    pub fn my_node(&self) -> Node {
        self.my_node.lock().unwrap().clone()
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Opens the CM event channel and spawns the control-event poller.
    pub fn start(self: &Arc<Self>, customer_id: i32) {
        self.should_stop.store(false, Ordering::Release);
        if !self.config.enable_ipc {
            log::info!("shared memory IPC is disabled");
        }

        if self.event_channel.load(Ordering::Acquire).is_null() {
            let ec = unsafe { rdma_create_event_channel() };
            assert!(
                !ec.is_null(),
                "failed to create CM event channel: {}",
                io::Error::last_os_error()
            );
            self.event_channel.store(ec, Ordering::Release);

            let van = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name("cm-poller".into())
                .spawn(move || van.poll_events())
                .expect("spawn cm poller");
            *self.cm_thread.lock().unwrap() = Some(handle);
        }
        log::debug!("van started for customer {}", customer_id);
    }

    /// Binds the CM listener on `node.port`, falling back to random high
    /// ports for up to `max_retry` extra attempts. Returns the bound port,
    /// or -1 if every attempt failed.
    pub fn bind(&self, node: &Node, max_retry: usize) -> Result<i32> {
        let ec = self.event_channel.load(Ordering::Acquire);
        assert!(!ec.is_null(), "bind before start");

        let mut listener: *mut rdma_cm_id = std::ptr::null_mut();
        if unsafe {
            rdma_create_id(
                ec,
                &mut listener,
                std::ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        } != 0
        {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        self.listener.store(listener, Ordering::Release);

        let ip: IpAddr = match &self.config.node_host {
            Some(host) => host
                .parse()
                .map_err(|_| Error::AddrResolve(host.clone()))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let mut rng = rand::thread_rng();
        let mut port = node.port as i32;
        if port == 0 {
            port = 10000 + rng.gen_range(0..40000);
        }
        for i in 0..=max_retry {
            let addr = SockAddr::from(SocketAddr::new(ip, port as u16));
            let rc = unsafe { rdma_bind_addr(listener, addr.as_ptr() as *mut sockaddr) };
            if rc == 0 {
                break;
            }
            if i == max_retry {
                port = -1;
            } else {
                port = 10000 + rng.gen_range(0..40000);
            }
        }
        if port < 0 {
            log::warn!("failed to bind a port after {} retries", max_retry);
            return Ok(-1);
        }

        if unsafe { rdma_listen(listener, LISTEN_BACKLOG) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        self.my_node.lock().unwrap().port = port as u16;
        log::info!("listening on port {}", port);
        Ok(port)
    }

    /// Establishes (or re-establishes) the connection to `node`, blocking
    /// until the endpoint reports connected. Rejections rebuild the CM
    /// identifier and retry after a short sleep.
    pub fn connect(&self, node: &Node) -> Result<()> {
        assert_ne!(node.id, Node::EMPTY_ID);
        assert!(!node.hostname.is_empty());
        log::debug!("connecting to node {}", node.id);

        let me = self.my_node();
        // workers do not talk to other workers, nor servers to servers
        if node.role == me.role && node.id != me.id {
            return Ok(());
        }

        let local = self.config.enable_ipc && node.hostname == me.hostname;
        self.is_local.lock().unwrap().insert(node.id, local);
        if local {
            log::info!("node {} is co-located, using IPC bypass", node.id);
        }

        let endpoint = Endpoint::new(node.id);
        {
            let mut endpoints = self.endpoints.lock().unwrap();
            if endpoints.remove(&node.id).is_some() {
                // a rebuilt connection invalidates every cached landing on
                // the old queue pair
                let mut caches = self.caches.lock().unwrap();
                caches.push_addr.retain(|(_, recver), _| *recver != node.id);
                caches.pull_addr.retain(|(_, recver), _| *recver != node.id);
                caches.pending.retain(|_, (_, _, recver)| *recver != node.id);
            }
            endpoints.insert(node.id, Arc::clone(&endpoint));
        }

        let remote = (node.hostname.as_str(), node.port)
            .to_socket_addrs()
            .map_err(|_| Error::AddrResolve(node.hostname.clone()))?
            .next()
            .ok_or_else(|| Error::AddrResolve(node.hostname.clone()))?;
        let remote = SockAddr::from(remote);

        let ec = self.event_channel.load(Ordering::Acquire);
        while endpoint.status() != ConnectionStatus::Connected {
            endpoint.set_status(ConnectionStatus::Connecting);

            let mut id: *mut rdma_cm_id = std::ptr::null_mut();
            if unsafe {
                rdma_create_id(
                    ec,
                    &mut id,
                    std::ptr::null_mut(),
                    rdma_port_space::RDMA_PS_TCP,
                )
            } != 0
            {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            unsafe {
                (*id).context = Arc::as_ptr(&endpoint) as *mut libc::c_void;
            }
            endpoint.replace_cm_id(id);

            self.resolve_addr(id, &remote)?;

            if endpoint.wait_connecting_done() == ConnectionStatus::Connected {
                break;
            }
            log::debug!("connection to node {} rejected, retrying", node.id);
            std::thread::sleep(Duration::from_millis(RETRY_SLEEP_MS));
        }

        endpoint.set_transport(self.make_transport(&endpoint, local));
        log::debug!("connected to node {}", node.id);
        Ok(())
    }

    fn resolve_addr(&self, id: *mut rdma_cm_id, remote: &SockAddr) -> Result<()> {
        let dst = remote.as_ptr() as *mut sockaddr;
        match &self.config.node_host {
            Some(host) => {
                // pin the source interface, probing source ports as needed
                let ip: IpAddr = host
                    .parse()
                    .map_err(|_| Error::AddrResolve(host.clone()))?;
                let mut rng = rand::thread_rng();
                let mut port = BASE_PORT as i32;
                for i in 0..=MAX_RESOLVE_RETRY {
                    let src = SockAddr::from(SocketAddr::new(ip, port as u16));
                    let rc = unsafe {
                        rdma_resolve_addr(id, src.as_ptr() as *mut sockaddr, dst, CM_TIMEOUT_MS)
                    };
                    if rc == 0 {
                        return Ok(());
                    }
                    if i == MAX_RESOLVE_RETRY {
                        break;
                    }
                    port = 10000 + rng.gen_range(0..40000);
                }
                Err(Error::AddrResolve(host.clone()))
            }
            None => {
                if unsafe { rdma_resolve_addr(id, std::ptr::null_mut(), dst, CM_TIMEOUT_MS) } != 0
                {
                    return Err(Error::Io(io::Error::last_os_error()));
                }
                Ok(())
            }
        }
    }

    fn make_transport(&self, endpoint: &Arc<Endpoint>, local: bool) -> Arc<dyn Transport> {
        let rdma = Arc::new(RdmaTransport::new(
            Arc::as_ptr(endpoint),
            self.send_pool(),
            self.recv_pool(),
            self.config.is_server(),
        ));
        if local {
            Arc::new(IpcTransport::new(rdma, &self.config))
        } else {
            rdma
        }
    }

    /// Stops the pollers and tears the verbs objects down in dependency
    /// order: pollers, endpoints (QPs), mempools (MRs), CQ, completion
    /// channel, PD, listener, event channel.
    pub fn stop(&self) {
        log::debug!("van stopping");
        self.should_stop.store(true, Ordering::Release);

        if let Some(handle) = self.cq_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.cm_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        // wake anything blocked in recv_msg
        *self.recv_tx.lock().unwrap() = None;

        self.endpoints.lock().unwrap().clear();
        self.incoming.lock().unwrap().clear();

        *self.send_pool.lock().unwrap() = None;
        *self.recv_pool.lock().unwrap() = None;

        unsafe {
            let cq = self.cq.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !cq.is_null() {
                assert_eq!(ibv_destroy_cq(cq), 0, "failed to destroy CQ");
            }
            let ch = self.comp_channel.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ch.is_null() {
                assert_eq!(ibv_destroy_comp_channel(ch), 0, "failed to destroy channel");
            }
            let pd = self.pd.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !pd.is_null() {
                assert_eq!(ibv_dealloc_pd(pd), 0, "failed to deallocate PD");
            }
            let listener = self.listener.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !listener.is_null() {
                rdma_destroy_id(listener);
            }
            let ec = self.event_channel.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ec.is_null() {
                rdma_destroy_event_channel(ec);
            }
        }
        self.context.store(std::ptr::null_mut(), Ordering::Release);
    }

    // ---- send / receive ----------------------------------------------------

    /// Sends a message to `msg.meta.recver`, returning the packed meta plus
    /// payload byte count.
    pub fn send_msg(&self, msg: &mut Message) -> Result<usize> {
        let remote_id = msg.meta.recver;
        assert_ne!(remote_id, Meta::EMPTY);

        let endpoint = self
            .endpoints
            .lock()
            .unwrap()
            .get(&remote_id)
            .cloned()
            .ok_or(Error::EndpointNotFound(remote_id))?;
        let trans = endpoint
            .try_transport()
            .ok_or(Error::NotConnected(remote_id))?;

        msg.meta.sender = self.my_node().id;
        trans.register_memory(msg);

        let is_pushpull = msg.meta.is_pushpull();
        if is_pushpull {
            trans.add_meta(msg);
            if !msg.meta.push && !msg.meta.request {
                self.fill_tensor_address(msg);
            }
        }
        encoding::describe_data(msg);

        let meta_len = encoding::packed_meta_len(&msg.meta);
        let total_len = meta_len + msg.data_len_total();

        let inline_buf = self.send_pool().alloc(meta_len);
        let packed =
            unsafe { std::slice::from_raw_parts_mut(inline_buf, meta_len) };
        encoding::pack_meta(&msg.meta, packed);

        let buf = Box::into_raw(Box::new(MessageBuffer {
            inline_buf,
            inline_len: meta_len,
            data: msg.data.clone(),
            mrs: Vec::new(),
        }));

        if !is_pushpull {
            trans.send_rendezvous_begin(msg, buf);
            return Ok(total_len);
        }

        unsafe {
            trans.prepare_data(msg, &mut *buf);
        }

        let key = msg.meta.key;
        let is_push = msg.meta.push;
        match self.remote_tuple_or_pend(key, is_push, remote_id, buf) {
            None => trans.send_rendezvous_begin(msg, buf),
            Some(remote) => match (msg.meta.push, msg.meta.request) {
                (true, true) => trans.send_push_request(msg, buf, remote),
                (true, false) => trans.send_push_response(msg, buf, remote),
                (false, true) => trans.send_pull_request(msg, buf, remote),
                (false, false) => trans.send_pull_response(msg, buf, remote),
            },
        }
        Ok(total_len)
    }

    /// Blocks until a message arrives, rebuilds its data views, and returns
    /// the byte count consumed.
    pub fn recv_msg(&self, msg: &mut Message) -> Result<usize> {
        msg.data.clear();
        let note = self.recv_rx.recv().map_err(|_| Error::Stopped)?;

        let endpoint = unsafe { &*note.endpoint };
        let buf_ctx = unsafe { &*note.ctx };

        let packed =
            unsafe { std::slice::from_raw_parts(buf_ctx.buffer, buf_ctx.meta_len) };
        msg.meta = encoding::unpack_meta(packed)?;
        msg.meta.recver = self.my_node().id;
        msg.meta.sender = endpoint.node_id;

        let meta_len = encoding::packed_meta_len(&msg.meta);
        let mut total_len = meta_len;

        if !msg.meta.is_pushpull() {
            // control landings are one-shot: buffer and pool slot recycle now
            self.recv_pool().free(buf_ctx.buffer);
            let taken = self.addr_pool.take(buf_ctx.idx);
            debug_assert_eq!(taken, note.ctx);
            drop(unsafe { Box::from_raw(note.ctx) });
            return Ok(total_len);
        }

        let trans = endpoint.transport();
        match (msg.meta.push, msg.meta.request) {
            (true, true) => {
                total_len += trans.recv_push_request(msg, buf_ctx, meta_len);
                self.store_tensor_address(&msg.meta);
            }
            (false, true) => total_len += trans.recv_pull_request(msg, buf_ctx, meta_len),
            (true, false) => total_len += trans.recv_push_response(msg, buf_ctx, meta_len),
            (false, false) => total_len += trans.recv_pull_response(msg, buf_ctx, meta_len),
        }
        Ok(total_len)
    }

    // ---- caches ------------------------------------------------------------

    /// Looks up the cached landing for (key, direction, peer). On a miss the
    /// message buffer is parked in the pending table (same lock) so the
    /// rendezvous reply can resolve it.
    fn remote_tuple_or_pend(
        &self,
        key: u64,
        is_push: bool,
        recver: i32,
        buf: *mut MessageBuffer,
    ) -> Option<RemoteTuple> {
        let mut caches = self.caches.lock().unwrap();
        let map = if is_push {
            &caches.push_addr
        } else {
            &caches.pull_addr
        };
        if let Some(remote) = map.get(&(key, recver)) {
            return Some(*remote);
        }
        caches.pending.insert(buf as u64, (key, is_push, recver));
        None
    }

    /// Resolves a pending rendezvous with the landing the peer granted.
    /// Control messages have no pending entry and stay uncached.
    fn store_remote_info(&self, reply: &RendezvousReply) {
        let mut caches = self.caches.lock().unwrap();
        if let Some((key, is_push, recver)) = caches.pending.remove(&reply.origin_addr) {
            let map = if is_push {
                &mut caches.push_addr
            } else {
                &mut caches.pull_addr
            };
            map.insert((key, recver), (reply.addr, reply.rkey, reply.idx));
        }
    }

    /// Records the worker tensor advertised by a push request. The triple is
    /// immutable for the connection: a change means corrupted state.
    fn store_tensor_address(&self, meta: &Meta) {
        use std::collections::hash_map::Entry;
        let mut info = self.tensor_info.lock().unwrap();
        let entry = (meta.val_len, meta.addr, meta.option);
        match info.entry((meta.key, meta.sender)) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
            Entry::Occupied(stored) => {
                assert_eq!(
                    *stored.get(),
                    entry,
                    "tensor (key={}, sender={}) changed its registration",
                    meta.key,
                    meta.sender
                );
            }
        }
    }

    /// Copies the stored tensor triple into an outgoing pull response so the
    /// worker recognizes the pre-agreed landing.
    fn fill_tensor_address(&self, msg: &mut Message) {
        let info = self.tensor_info.lock().unwrap();
        let (val_len, addr, rkey) = info
            .get(&(msg.meta.key, msg.meta.recver))
            .unwrap_or_else(|| {
                panic!(
                    "pull response for key {} before any push from node {}",
                    msg.meta.key, msg.meta.recver
                )
            });
        msg.meta.val_len = *val_len;
        msg.meta.addr = *addr;
        msg.meta.option = *rkey;
    }

    fn send_pool(&self) -> Arc<Mempool> {
        self.send_pool
            .lock()
            .unwrap()
            .clone()
            .expect("send mempool not initialized")
    }

    fn recv_pool(&self) -> Arc<Mempool> {
        self.recv_pool
            .lock()
            .unwrap()
            .clone()
            .expect("recv mempool not initialized")
    }

    // ---- verbs context -----------------------------------------------------

    /// First connection wins: one protection domain, one CQ, both mempools.
    fn init_context(&self, verbs: *mut ibv_context) {
        assert!(!verbs.is_null(), "CM identifier carries no verbs context");
        self.context.store(verbs, Ordering::Release);

        let pd = unsafe { ibv_alloc_pd(verbs) };
        assert!(!pd.is_null(), "failed to allocate protection domain");
        self.pd.store(pd, Ordering::Release);

        *self.send_pool.lock().unwrap() = Some(Arc::new(Mempool::new(pd)));
        *self.recv_pool.lock().unwrap() = Some(Arc::new(Mempool::new(pd)));

        let comp_channel = unsafe { ibv_create_comp_channel(verbs) };
        assert!(!comp_channel.is_null(), "failed to create completion channel");
        self.comp_channel.store(comp_channel, Ordering::Release);

        let cq = unsafe {
            ibv_create_cq(
                verbs,
                (MAX_CONCURRENT_WR * 2) as i32,
                std::ptr::null_mut(),
                comp_channel,
                0,
            )
        };
        assert!(!cq.is_null(), "failed to create completion queue");
        assert_eq!(
            unsafe { ibv_req_notify_cq(cq, 0) },
            0,
            "failed to request CQ notification"
        );
        self.cq.store(cq, Ordering::Release);
    }

    // ---- completion-queue poller -------------------------------------------

    fn poll_cq(&self) {
        let cq = self.cq.load(Ordering::Acquire);
        assert!(!cq.is_null());
        let mut wc: Vec<ibv_wc> = (0..MAX_CONCURRENT_WR)
            .map(|_| unsafe { std::mem::zeroed() })
            .collect();

        while !self.should_stop.load(Ordering::Acquire) {
            let ne = unsafe { ibv_poll_cq(cq, MAX_CONCURRENT_WR as i32, wc.as_mut_ptr()) };
            assert!(ne >= 0, "ibv_poll_cq failed");
            for c in wc.iter().take(ne as usize) {
                assert_eq!(
                    c.status,
                    ibv_wc_status::IBV_WC_SUCCESS,
                    "work completion failed: {} (wr_id={}, vendor_err={})",
                    wc_status_str(c.status),
                    c.wr_id,
                    c.vendor_err
                );

                let ctx = c.wr_id as usize as *mut WrContext;
                let endpoint = unsafe { &*(*ctx).endpoint };

                match c.opcode {
                    ibv_wc_opcode::IBV_WC_SEND => {
                        endpoint.release_ctx(ctx);
                    }
                    ibv_wc_opcode::IBV_WC_RDMA_WRITE => {
                        // the message is delivered; drop its outbound state
                        unsafe {
                            let scratch = (*(*ctx).mr).addr as *const u64;
                            let buf = *scratch as usize as *mut MessageBuffer;
                            let buf = Box::from_raw(buf);
                            self.send_pool().free(buf.inline_buf);
                        }
                        endpoint.release_ctx(ctx);
                    }
                    ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => {
                        let idx = unsafe { c.imm_data_invalidated_rkey_union.imm_data };
                        let buf_ctx = self.addr_pool.get(idx);
                        self.notify_recv(RecvNotification {
                            endpoint: unsafe { (*ctx).endpoint },
                            ctx: buf_ctx,
                        });
                        endpoint.release_ctx(ctx);
                    }
                    ibv_wc_opcode::IBV_WC_RECV => {
                        assert!(
                            c.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM.0 != 0,
                            "two-sided receive without immediate"
                        );
                        let imm = unsafe { c.imm_data_invalidated_rkey_union.imm_data };
                        let chunk = unsafe { (*(*ctx).mr).addr as *const u8 };
                        match imm {
                            IMM_RENDEZVOUS_START => {
                                let req = unsafe { read_rendezvous_start(chunk) };
                                endpoint
                                    .transport()
                                    .send_rendezvous_reply(req, &self.addr_pool);
                            }
                            IMM_RENDEZVOUS_REPLY => {
                                let reply = unsafe { read_rendezvous_reply(chunk) };
                                // cache before writing so later sends of the
                                // same key skip rendezvous
                                self.store_remote_info(&reply);
                                endpoint.transport().write_with_imm(
                                    reply.origin_addr as usize as *mut MessageBuffer,
                                    reply.addr,
                                    reply.rkey,
                                    reply.idx,
                                );
                            }
                            other => panic!("unexpected rendezvous immediate {}", other),
                        }
                        endpoint.release_ctx(ctx);
                    }
                    other => panic!("unexpected completion opcode {}", other),
                }
            }
        }
    }

    fn notify_recv(&self, note: RecvNotification) {
        if let Some(tx) = self.recv_tx.lock().unwrap().as_ref() {
            let _ = tx.send(note);
        }
    }

    // ---- control-event poller ----------------------------------------------

    fn poll_events(self: Arc<Self>) {
        let ec = self.event_channel.load(Ordering::Acquire);
        let fd = unsafe { (*ec).fd };
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            assert!(flags >= 0);
            assert!(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) >= 0);
        }
        let error_flags = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

        while !self.should_stop.load(Ordering::Acquire) {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, CM_POLL_MS) };
            assert!(rc >= 0, "poll on CM channel failed: {}", io::Error::last_os_error());
            assert_eq!(pfd.revents & error_flags, 0, "CM channel poll error");
            if pfd.revents & libc::POLLIN == 0 {
                continue;
            }

            let mut event: *mut rdma_cm_event = std::ptr::null_mut();
            assert_eq!(unsafe { rdma_get_cm_event(ec, &mut event) }, 0);

            match unsafe { (*event).event } {
                rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => {
                    self.on_connect_request(event)
                }
                rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => self.on_addr_resolved(event),
                rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => self.on_route_resolved(event),
                rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => self.on_connected(event),
                rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => self.on_disconnected(event),
                rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => self.on_rejected(event),
                other => panic!("unknown CM event {}", cm_event_str(other)),
            }
            unsafe {
                rdma_ack_cm_event(event);
            }
        }
    }

    fn on_addr_resolved(&self, event: *mut rdma_cm_event) {
        let id = unsafe { (*event).id };
        assert_eq!(
            unsafe { rdma_resolve_route(id, CM_TIMEOUT_MS) },
            0,
            "failed to resolve RDMA route"
        );
    }

    fn on_route_resolved(&self, event: *mut rdma_cm_event) {
        let id = unsafe { (*event).id };
        let endpoint = unsafe { &*((*id).context as *const Endpoint) };

        if self.context.load(Ordering::Acquire).is_null() {
            self.init_context(unsafe { (*id).verbs });
        }
        endpoint
            .init(
                self.cq.load(Ordering::Acquire),
                self.pd.load(Ordering::Acquire),
            )
            .expect("endpoint init failed");

        let me = self.my_node();
        let ctx = RequestContext::new(me.id as u32, me.port, &me.hostname);
        let private_data = encode_request_context(&ctx);

        let mut param: rdma_conn_param = unsafe { std::mem::zeroed() };
        param.retry_count = 7;
        param.rnr_retry_count = 7;
        param.private_data = private_data.as_ptr() as *const libc::c_void;
        param.private_data_len = REQUEST_CONTEXT_SIZE as u8;

        assert_eq!(
            unsafe { rdma_connect(id, &mut param) },
            0,
            "rdma_connect failed: {}",
            io::Error::last_os_error()
        );
    }

    fn on_connect_request(self: &Arc<Self>, event: *mut rdma_cm_event) {
        let id = unsafe { (*event).id };
        assert!(!id.is_null());

        let (private_data, private_len) = unsafe {
            (
                (*event).param.conn.private_data as *const u8,
                (*event).param.conn.private_data_len as usize,
            )
        };
        assert!(
            private_len >= REQUEST_CONTEXT_SIZE,
            "connect request carries short private data ({} bytes)",
            private_len
        );
        let remote = decode_request_context(unsafe {
            std::slice::from_raw_parts(private_data, private_len)
        })
        .expect("malformed connect request context");

        let endpoint = Endpoint::new(remote.node as i32);
        endpoint.replace_cm_id(id);
        unsafe {
            (*id).context = Arc::as_ptr(&endpoint) as *mut libc::c_void;
        }

        if self.context.load(Ordering::Acquire).is_null() {
            self.init_context(unsafe { (*id).verbs });
        }
        endpoint
            .init(
                self.cq.load(Ordering::Acquire),
                self.pd.load(Ordering::Acquire),
            )
            .expect("incoming endpoint init failed");

        let local = self
            .is_local
            .lock()
            .unwrap()
            .get(&(remote.node as i32))
            .copied()
            .unwrap_or(false);
        endpoint.set_transport(self.make_transport(&endpoint, local));
        self.incoming.lock().unwrap().push(Arc::clone(&endpoint));

        let me = self.my_node();
        let ctx = RequestContext::new(me.id as u32, me.port, &me.hostname);
        let private_data = encode_request_context(&ctx);

        let mut param: rdma_conn_param = unsafe { std::mem::zeroed() };
        param.retry_count = 7;
        param.rnr_retry_count = 7;
        param.private_data = private_data.as_ptr() as *const libc::c_void;
        param.private_data_len = REQUEST_CONTEXT_SIZE as u8;

        assert_eq!(
            unsafe { rdma_accept(id, &mut param) },
            0,
            "rdma_accept failed: {}",
            io::Error::last_os_error()
        );
    }

    fn on_connected(self: &Arc<Self>, event: *mut rdma_cm_event) {
        let id = unsafe { (*event).id };
        let endpoint = unsafe { &*((*id).context as *const Endpoint) };

        // first established connection brings up the data-path poller
        let mut cq_thread = self.cq_thread.lock().unwrap();
        if cq_thread.is_none() {
            let van = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name("cq-poller".into())
                .spawn(move || van.poll_cq())
                .expect("spawn cq poller");
            *cq_thread = Some(handle);
        }
        drop(cq_thread);

        endpoint.set_status(ConnectionStatus::Connected);
        log::debug!("connected to node {}", endpoint.node_id);
    }

    fn on_rejected(&self, event: *mut rdma_cm_event) {
        let id = unsafe { (*event).id };
        let endpoint = unsafe { &*((*id).context as *const Endpoint) };
        assert_eq!(endpoint.status(), ConnectionStatus::Connecting);
        log::debug!("connection to node {} rejected", endpoint.node_id);
        endpoint.set_status(ConnectionStatus::Rejected);
    }

    fn on_disconnected(&self, event: *mut rdma_cm_event) {
        let id = unsafe { (*event).id };
        let endpoint = unsafe { &*((*id).context as *const Endpoint) };
        endpoint.set_status(ConnectionStatus::Idle);
        log::info!("disconnected from node {}", endpoint.node_id);
    }
}

fn wc_status_str(status: u32) -> String {
    unsafe {
        let s = ibv_wc_status_str(status);
        if s.is_null() {
            format!("status {}", status)
        } else {
            std::ffi::CStr::from_ptr(s).to_string_lossy().into_owned()
        }
    }
}

fn cm_event_str(event: u32) -> String {
    unsafe {
        let s = rdma_event_str(event);
        if s.is_null() {
            format!("event {}", event)
        } else {
            std::ffi::CStr::from_ptr(s).to_string_lossy().into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    fn test_van() -> Arc<Van> {
        Van::new(
            Node {
                id: 1,
                role: Role::Server,
                hostname: "localhost".into(),
                port: 0,
            },
            Config::default(),
        )
    }

    #[test]
    fn tensor_registry_is_write_once() {
        let van = test_van();
        let meta = Meta {
            key: 7,
            sender: 9,
            val_len: 1024,
            addr: 0x1000,
            option: 3,
            ..Meta::default()
        };
        van.store_tensor_address(&meta);
        van.store_tensor_address(&meta); // identical re-registration is fine

        let mut msg = Message::default();
        msg.meta.key = 7;
        msg.meta.recver = 9;
        van.fill_tensor_address(&mut msg);
        assert_eq!(msg.meta.val_len, 1024);
        assert_eq!(msg.meta.addr, 0x1000);
        assert_eq!(msg.meta.option, 3);
    }

    #[test]
    #[should_panic(expected = "changed its registration")]
    fn tensor_registry_rejects_mutation() {
        let van = test_van();
        let mut meta = Meta {
            key: 7,
            sender: 9,
            val_len: 1024,
            addr: 0x1000,
            option: 3,
            ..Meta::default()
        };
        van.store_tensor_address(&meta);
        meta.addr = 0x2000;
        van.store_tensor_address(&meta);
    }

    #[test]
    fn address_cache_resolves_pending_rendezvous() {
        let van = test_van();
        let buf = 0xdead0usize as *mut MessageBuffer;

        // first send of (key 7, push, peer 9) misses and parks the buffer
        assert!(van.remote_tuple_or_pend(7, true, 9, buf).is_none());

        let reply = RendezvousReply {
            addr: 0x5000,
            origin_addr: buf as u64,
            rkey: 11,
            idx: 2,
        };
        van.store_remote_info(&reply);

        // steady state: the cached landing is returned
        assert_eq!(
            van.remote_tuple_or_pend(7, true, 9, buf),
            Some((0x5000, 11, 2))
        );
        // the pull direction of the same key is tracked separately
        assert!(van.remote_tuple_or_pend(7, false, 9, buf).is_none());
    }

    #[test]
    fn control_replies_are_not_cached() {
        let van = test_van();
        // no pending entry for this origin: reply must be ignored
        let reply = RendezvousReply {
            addr: 1,
            origin_addr: 0x9999,
            rkey: 1,
            idx: 0,
        };
        van.store_remote_info(&reply);
        assert!(van
            .remote_tuple_or_pend(1, true, 2, std::ptr::null_mut())
            .is_none());
    }
}
