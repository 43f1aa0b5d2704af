//! Per-peer endpoint state.
//!
//! An endpoint owns the rdma_cm identifier and queue pair for one peer, plus
//! pre-allocated work-request contexts. The context address doubles as the
//! wire `wr_id`, so the completion-queue poller can recover both the context
//! and (through its back-pointer) the endpoint from any completion. Contexts
//! are handed out through blocking free-lists, which is also what bounds the
//! number of outstanding work-requests per kind.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};
use rdma_sys::*;

use crate::error::{Error, Result};
use crate::mempool::page_size;
use crate::transport::Transport;
use crate::{MEMPOOL_CHUNK_SIZE, REPLY_DEPTH, RX_DEPTH, SG_ENTRIES, START_DEPTH, WRITE_DEPTH};

/// Connection state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Rejected,
}

/// What a work-request context is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrKind {
    Recv,
    RendezvousStart,
    RendezvousReply,
    Write,
}

/// Bookkeeping for one in-flight work request. The address of this record
/// travels as the `wr_id`.
pub struct WrContext {
    pub kind: WrKind,
    /// Registered chunk backing the request (scatter target for receives,
    /// rendezvous pod or message-buffer scratch for sends).
    pub mr: *mut ibv_mr,
    /// Owning endpoint; valid while the endpoint is alive, which shutdown
    /// ordering guarantees outlasts the CQ poller.
    pub endpoint: *const Endpoint,
}

/// Send-safe wrapper for context pointers travelling through free-lists.
#[derive(Clone, Copy)]
pub struct WrPtr(pub *mut WrContext);

unsafe impl Send for WrPtr {}

pub struct Endpoint {
    pub node_id: i32,
    status: Mutex<ConnectionStatus>,
    cv: Condvar,
    cm_id: AtomicPtr<rdma_cm_id>,
    trans: Mutex<Option<Arc<dyn Transport>>>,
    /// Owns every context; boxes pin the addresses used as wr_ids.
    ctxs: Mutex<Vec<Box<WrContext>>>,
    free_start: (Sender<WrPtr>, Receiver<WrPtr>),
    free_reply: (Sender<WrPtr>, Receiver<WrPtr>),
    free_write: (Sender<WrPtr>, Receiver<WrPtr>),
}

unsafe impl Send for Endpoint {}
unsafe impl Sync for Endpoint {}

impl Endpoint {
    pub fn new(node_id: i32) -> Arc<Endpoint> {
        Arc::new(Endpoint {
            node_id,
            status: Mutex::new(ConnectionStatus::Idle),
            cv: Condvar::new(),
            cm_id: AtomicPtr::new(std::ptr::null_mut()),
            trans: Mutex::new(None),
            ctxs: Mutex::new(Vec::new()),
            free_start: bounded(START_DEPTH),
            free_reply: bounded(REPLY_DEPTH),
            free_write: bounded(WRITE_DEPTH),
        })
    }

    // ---- connection status -------------------------------------------------

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap() = status;
        self.cv.notify_all();
    }

    /// Blocks until the endpoint leaves `Connecting`, returning the state it
    /// settled in.
    pub fn wait_connecting_done(&self) -> ConnectionStatus {
        let mut status = self.status.lock().unwrap();
        while *status == ConnectionStatus::Connecting {
            status = self.cv.wait(status).unwrap();
        }
        *status
    }

    /// Issues a disconnect and waits for the CM poller to report `Idle`.
    pub fn disconnect(&self) {
        let id = self.cm_id.load(Ordering::Acquire);
        if !id.is_null() {
            unsafe {
                rdma_disconnect(id);
            }
        }
        let mut status = self.status.lock().unwrap();
        while *status != ConnectionStatus::Idle {
            status = self.cv.wait(status).unwrap();
        }
        *self.trans.lock().unwrap() = None;
    }

    // ---- cm id / qp --------------------------------------------------------

    pub fn cm_id(&self) -> *mut rdma_cm_id {
        self.cm_id.load(Ordering::Acquire)
    }

    /// Installs a fresh CM identifier, tearing down the previous one.
    /// Connect retries replace the identifier before the endpoint reaches
    /// `Connected`.
    pub fn replace_cm_id(&self, id: *mut rdma_cm_id) {
        let old = self.cm_id.swap(id, Ordering::AcqRel);
        if !old.is_null() {
            unsafe {
                if !(*old).qp.is_null() {
                    rdma_destroy_qp(old);
                }
                rdma_destroy_id(old);
            }
        }
    }

    pub fn qp(&self) -> *mut ibv_qp {
        let id = self.cm_id.load(Ordering::Acquire);
        assert!(!id.is_null());
        unsafe { (*id).qp }
    }

    // ---- transport ---------------------------------------------------------

    pub fn set_transport(&self, t: Arc<dyn Transport>) {
        *self.trans.lock().unwrap() = Some(t);
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.try_transport()
            .expect("endpoint has no transport installed")
    }

    pub fn try_transport(&self) -> Option<Arc<dyn Transport>> {
        self.trans.lock().unwrap().clone()
    }

    // ---- queue pair and context setup --------------------------------------

    /// Creates the queue pair on the current CM identifier and (re)arms the
    /// context free-lists and receive queue.
    pub fn init(&self, cq: *mut ibv_cq, pd: *mut ibv_pd) -> Result<()> {
        let id = self.cm_id.load(Ordering::Acquire);
        assert!(!id.is_null());

        let mut attr: ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        attr.send_cq = cq;
        attr.recv_cq = cq;
        attr.cap.max_send_wr = (START_DEPTH + REPLY_DEPTH + WRITE_DEPTH) as u32;
        attr.cap.max_recv_wr = RX_DEPTH as u32;
        attr.cap.max_send_sge = SG_ENTRIES as u32;
        attr.cap.max_recv_sge = SG_ENTRIES as u32;
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.sq_sig_all = 0;

        if unsafe { rdma_create_qp(id, pd, &mut attr) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        {
            let mut ctxs = self.ctxs.lock().unwrap();
            if ctxs.is_empty() {
                self.alloc_contexts(&mut ctxs, pd);
            }

            // Rebuild the free-lists from scratch; a reconnect invalidates
            // whatever was outstanding on the old queue pair.
            for chan in [&self.free_start, &self.free_reply, &self.free_write] {
                while chan.1.try_recv().is_ok() {}
            }
            for ctx in ctxs.iter_mut() {
                let ptr = ctx.as_mut() as *mut WrContext;
                match ctx.kind {
                    WrKind::RendezvousStart => self.free_start.0.send(WrPtr(ptr)).unwrap(),
                    WrKind::RendezvousReply => self.free_reply.0.send(WrPtr(ptr)).unwrap(),
                    WrKind::Write => self.free_write.0.send(WrPtr(ptr)).unwrap(),
                    WrKind::Recv => {}
                }
            }
            for ctx in ctxs.iter_mut() {
                if ctx.kind == WrKind::Recv {
                    self.post_recv(ctx.as_mut() as *mut WrContext);
                }
            }
        }
        Ok(())
    }

    fn alloc_contexts(&self, ctxs: &mut Vec<Box<WrContext>>, pd: *mut ibv_pd) {
        let me = self as *const Endpoint;
        let sets = [
            (WrKind::RendezvousStart, START_DEPTH, 0u32),
            (WrKind::RendezvousReply, REPLY_DEPTH, 0),
            (WrKind::Write, WRITE_DEPTH, 0),
            (
                WrKind::Recv,
                RX_DEPTH,
                ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0,
            ),
        ];
        for (kind, depth, access) in sets {
            for _ in 0..depth {
                let mr = register_chunk(pd, access);
                ctxs.push(Box::new(WrContext {
                    kind,
                    mr,
                    endpoint: me,
                }));
            }
        }
    }

    /// Posts one receive work-request scattered into `ctx`'s chunk.
    pub fn post_recv(&self, ctx: *mut WrContext) {
        let mut sge: ibv_sge = unsafe { std::mem::zeroed() };
        unsafe {
            sge.addr = (*(*ctx).mr).addr as u64;
            sge.lkey = (*(*ctx).mr).lkey;
        }
        sge.length = MEMPOOL_CHUNK_SIZE as u32;

        let mut wr: ibv_recv_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = ctx as u64;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        let mut bad_wr: *mut ibv_recv_wr = std::ptr::null_mut();
        let rc = unsafe { ibv_post_recv(self.qp(), &mut wr, &mut bad_wr) };
        assert_eq!(rc, 0, "ibv_post_recv failed: {}", io::Error::last_os_error());
    }

    // ---- context free-lists ------------------------------------------------

    /// Blocks until a rendezvous-start context is free.
    pub fn pick_start_ctx(&self) -> *mut WrContext {
        self.free_start.1.recv().unwrap().0
    }

    /// Blocks until a rendezvous-reply context is free.
    pub fn pick_reply_ctx(&self) -> *mut WrContext {
        self.free_reply.1.recv().unwrap().0
    }

    /// Blocks until a write context is free.
    pub fn pick_write_ctx(&self) -> *mut WrContext {
        self.free_write.1.recv().unwrap().0
    }

    /// Returns a context after its completion: send contexts rejoin their
    /// free-list, receive contexts are re-armed on the queue pair.
    pub fn release_ctx(&self, ctx: *mut WrContext) {
        match unsafe { (*ctx).kind } {
            WrKind::RendezvousStart => self.free_start.0.send(WrPtr(ctx)).unwrap(),
            WrKind::RendezvousReply => self.free_reply.0.send(WrPtr(ctx)).unwrap(),
            WrKind::Write => self.free_write.0.send(WrPtr(ctx)).unwrap(),
            WrKind::Recv => self.post_recv(ctx),
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // Transport first: IPC copy workers must stop posting on the queue
        // pair before it is destroyed.
        *self.trans.lock().unwrap() = None;
        self.replace_cm_id(std::ptr::null_mut());

        let layout = chunk_layout();
        for ctx in self.ctxs.lock().unwrap().drain(..) {
            unsafe {
                let addr = (*ctx.mr).addr as *mut u8;
                ibv_dereg_mr(ctx.mr);
                dealloc(addr, layout);
            }
        }
    }
}

fn chunk_layout() -> Layout {
    Layout::from_size_align(MEMPOOL_CHUNK_SIZE, page_size()).expect("chunk layout")
}

fn register_chunk(pd: *mut ibv_pd, access: u32) -> *mut ibv_mr {
    let buf = unsafe { alloc_zeroed(chunk_layout()) };
    assert!(!buf.is_null());
    let mr = unsafe {
        ibv_reg_mr(
            pd,
            buf as *mut libc::c_void,
            MEMPOOL_CHUNK_SIZE,
            access as i32,
        )
    };
    assert!(
        !mr.is_null(),
        "chunk registration failed: {}",
        io::Error::last_os_error()
    );
    mr
}
