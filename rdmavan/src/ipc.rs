//! Shared-memory bypass for co-located peers.
//!
//! When sender and receiver share a host, tensor values move through POSIX
//! shared memory instead of the NIC; metadata still traverses the RDMA path
//! (rendezvous plus signaled write) so the receiver's completion-driven
//! hand-off is unchanged. Pull-response copies run on a small worker pool so
//! large memcpys do not stall the send path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

use shmipc::SegmentTable;

use crate::addrpool::AddressPool;
use crate::config::Config;
use crate::encoding::RendezvousStart;
use crate::mempool::page_size;
use crate::message::{Message, Segment};
use crate::transport::{BufferContext, MessageBuffer, RdmaTransport, RemoteTuple, Transport};

/// Shared-memory object name prefix; the full name is `<prefix><base_key>`.
pub const SHM_PREFIX: &str = "BytePS_ShM_";

struct CopyJob {
    buf: *mut MessageBuffer,
    remote: RemoteTuple,
    dst: *mut u8,
    src: *const u8,
    len: usize,
}

unsafe impl Send for CopyJob {}

enum Job {
    Copy(CopyJob),
    Shutdown,
}

pub struct IpcTransport {
    rdma: Arc<RdmaTransport>,
    segments: SegmentTable,
    queues: Vec<Sender<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    copy_counter: AtomicUsize,
    async_copy: bool,
}

impl IpcTransport {
    pub fn new(rdma: Arc<RdmaTransport>, config: &Config) -> Self {
        let partition_bytes = config.partition_bytes_aligned(page_size());
        let nthreads = config.ipc_copy_threads.max(1);

        let mut queues = Vec::with_capacity(nthreads);
        let mut workers = Vec::with_capacity(nthreads);
        for i in 0..nthreads {
            let (tx, rx) = unbounded::<Job>();
            let trans = Arc::clone(&rdma);
            let handle = std::thread::Builder::new()
                .name(format!("ipc-copy-{}", i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let job = match job {
                            Job::Copy(j) => j,
                            Job::Shutdown => break,
                        };
                        if job.len > 0 {
                            unsafe {
                                std::ptr::copy_nonoverlapping(job.src, job.dst, job.len);
                            }
                        }
                        let (raddr, rkey, idx) = job.remote;
                        trans.write_with_imm(job.buf, raddr, rkey, idx);
                    }
                })
                .expect("spawn ipc copy worker");
            queues.push(tx);
            workers.push(handle);
        }

        if !config.ipc_async_copy {
            log::info!("async IPC copy disabled; copies run on the send path");
        }

        Self {
            rdma,
            segments: SegmentTable::new(SHM_PREFIX, partition_bytes),
            queues,
            workers: Mutex::new(workers),
            copy_counter: AtomicUsize::new(0),
            async_copy: config.ipc_async_copy,
        }
    }

    fn partition(&self, key: u64) -> *mut u8 {
        self.segments
            .partition(key)
            .unwrap_or_else(|e| panic!("shared memory for key {} unavailable: {}", key, e))
    }
}

impl Transport for IpcTransport {
    fn register_memory(&self, msg: &Message) {
        self.rdma.register_memory(msg)
    }

    fn add_meta(&self, msg: &mut Message) {
        self.rdma.add_meta(msg)
    }

    fn prepare_data(&self, msg: &Message, buf: &mut MessageBuffer) {
        self.rdma.prepare_data(msg, buf)
    }

    fn send_rendezvous_begin(&self, msg: &Message, buf: *mut MessageBuffer) {
        self.rdma.send_rendezvous_begin(msg, buf)
    }

    fn send_rendezvous_reply(&self, req: RendezvousStart, pool: &AddressPool<BufferContext>) {
        self.rdma.send_rendezvous_reply(req, pool)
    }

    fn write_with_imm(&self, buf: *mut MessageBuffer, remote_addr: u64, rkey: u32, idx: u32) {
        self.rdma.write_with_imm(buf, remote_addr, rkey, idx)
    }

    fn send_push_request(&self, _msg: &Message, buf: *mut MessageBuffer, remote: RemoteTuple) {
        // values are already in shared memory; emit only the meta write
        unsafe {
            (*buf).mrs.clear();
        }
        self.rdma.write_with_imm(buf, remote.0, remote.1, remote.2);
    }

    fn send_push_response(&self, msg: &Message, buf: *mut MessageBuffer, remote: RemoteTuple) {
        self.rdma.send_push_response(msg, buf, remote)
    }

    fn send_pull_request(&self, msg: &Message, buf: *mut MessageBuffer, remote: RemoteTuple) {
        self.rdma.send_pull_request(msg, buf, remote)
    }

    fn send_pull_response(&self, msg: &Message, buf: *mut MessageBuffer, remote: RemoteTuple) {
        let src = msg.data[1].as_ptr();
        let len = msg.meta.val_len as usize;
        let dst = self.partition(msg.meta.key);

        if self.async_copy {
            let n = self.copy_counter.fetch_add(1, Ordering::Relaxed);
            let queue = &self.queues[n % self.queues.len()];
            queue
                .send(Job::Copy(CopyJob {
                    buf,
                    remote,
                    dst,
                    src,
                    len,
                }))
                .expect("ipc copy queue closed");
        } else {
            if len > 0 {
                unsafe {
                    std::ptr::copy_nonoverlapping(src, dst, len);
                }
            }
            self.rdma.write_with_imm(buf, remote.0, remote.1, remote.2);
        }
    }

    fn recv_push_request(&self, msg: &mut Message, _ctx: &BufferContext, _meta_len: usize) -> usize {
        assert!(msg.meta.push && msg.meta.request);
        // the payload is in local shared memory, not in the landing buffer
        let len = msg.meta.val_len as usize;
        let addr = self.partition(msg.meta.key);

        let keys = Segment::copy_of(&msg.meta.key.to_le_bytes());
        let vals = unsafe { Segment::view(addr, len) };
        let lens = Segment::copy_of(&(msg.meta.val_len as i32).to_le_bytes());

        let total = keys.len() + vals.len() + lens.len();
        msg.data = vec![keys, vals, lens];
        total
    }

    fn recv_pull_request(&self, msg: &mut Message, ctx: &BufferContext, meta_len: usize) -> usize {
        self.rdma.recv_pull_request(msg, ctx, meta_len)
    }

    fn recv_push_response(&self, msg: &mut Message, ctx: &BufferContext, meta_len: usize) -> usize {
        self.rdma.recv_push_response(msg, ctx, meta_len)
    }

    fn recv_pull_response(&self, msg: &mut Message, ctx: &BufferContext, meta_len: usize) -> usize {
        self.rdma.recv_pull_response(msg, ctx, meta_len)
    }
}

impl Drop for IpcTransport {
    fn drop(&mut self) {
        for queue in &self.queues {
            let _ = queue.send(Job::Shutdown);
        }
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}
