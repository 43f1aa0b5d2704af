//! Message and metadata types.
//!
//! A [`Message`] is a metadata record plus up to four data fields. For a push
//! request the fields are `[keys, values, lengths]`; a pull response carries
//! the same three with the values living at a pre-agreed remote address;
//! control messages carry none.

use std::sync::Arc;

/// Maximum number of data fields a message may carry.
pub const MAX_DATA_FIELDS: usize = 4;

/// Role of a node in the parameter-server topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Worker,
    Server,
    Scheduler,
}

impl Role {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Role::Worker => 0,
            Role::Server => 1,
            Role::Scheduler => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Role> {
        match v {
            0 => Some(Role::Worker),
            1 => Some(Role::Server),
            2 => Some(Role::Scheduler),
            _ => None,
        }
    }
}

/// Identity of one process in the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: i32,
    pub role: Role,
    pub hostname: String,
    pub port: u16,
}

impl Node {
    /// Id of a node that has not been assigned one yet.
    pub const EMPTY_ID: i32 = -1;
}

/// Control command carried by non-data messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    #[default]
    Empty,
    Terminate,
    AddNode,
    Barrier,
    Ack,
    Heartbeat,
}

impl Command {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Command::Empty => 0,
            Command::Terminate => 1,
            Command::AddNode => 2,
            Command::Barrier => 3,
            Command::Ack => 4,
            Command::Heartbeat => 5,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Command> {
        match v {
            0 => Some(Command::Empty),
            1 => Some(Command::Terminate),
            2 => Some(Command::AddNode),
            3 => Some(Command::Barrier),
            4 => Some(Command::Ack),
            5 => Some(Command::Heartbeat),
            _ => None,
        }
    }
}

/// Control sub-record of [`Meta`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Control {
    pub cmd: Command,
    pub nodes: Vec<Node>,
    pub barrier_group: i32,
    pub msg_sig: u64,
}

impl Control {
    /// A control record with no command is what makes a message a data
    /// (push/pull) message.
    pub fn is_empty(&self) -> bool {
        self.cmd == Command::Empty
    }
}

/// Message metadata.
///
/// `addr` and `option` carry the remote address and rkey of the value buffer
/// for one-sided transfers; they are filled by the transport, not the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    pub sender: i32,
    pub recver: i32,
    pub timestamp: i32,
    pub customer_id: i32,
    /// Request (true) or response (false).
    pub request: bool,
    /// Push (true) or pull (false); meaningful only for data messages.
    pub push: bool,
    /// Marks app-level messages that bypass the push/pull data path.
    pub simple_app: bool,
    pub key: u64,
    /// Remote address of the value buffer.
    pub addr: u64,
    /// Length of the value field in bytes.
    pub val_len: u32,
    /// Remote key of the value buffer.
    pub option: u32,
    pub body: Vec<u8>,
    pub control: Control,
    /// Number of data fields the message carries.
    pub data_num: u8,
    /// Byte length of each data field.
    pub data_len: [u64; MAX_DATA_FIELDS],
}

impl Meta {
    pub const EMPTY: i32 = -1;

    /// True for push/pull data messages, false for control traffic.
    pub fn is_pushpull(&self) -> bool {
        self.control.is_empty() && !self.simple_app
    }
}

/// One data field of a message.
///
/// `Shared` owns its bytes behind an `Arc` so clones alias the same stable
/// allocation (the address may be registered with the NIC). `View` borrows
/// registered or shared memory owned by the transport; it is valid for as
/// long as the connection that produced it.
#[derive(Debug, Clone)]
pub enum Segment {
    Shared(Arc<Vec<u8>>),
    View { ptr: *const u8, len: usize },
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub fn from_vec(v: Vec<u8>) -> Self {
        Segment::Shared(Arc::new(v))
    }

    pub fn copy_of(bytes: &[u8]) -> Self {
        Segment::Shared(Arc::new(bytes.to_vec()))
    }

    /// A zero-copy view over `len` bytes at `ptr`.
    ///
    /// # Safety
    /// The memory must stay valid and immutable for the lifetime of the
    /// segment and all its clones.
    pub unsafe fn view(ptr: *const u8, len: usize) -> Self {
        Segment::View { ptr, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Segment::Shared(v) => v.len(),
            Segment::View { len, .. } => *len,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        match self {
            Segment::Shared(v) => v.as_ptr(),
            Segment::View { ptr, .. } => *ptr,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Segment::Shared(v) => v.as_slice(),
            Segment::View { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
        }
    }
}

/// A message: metadata plus its data fields.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub meta: Meta,
    pub data: Vec<Segment>,
}

impl Message {
    /// Total bytes across all data fields.
    pub fn data_len_total(&self) -> usize {
        self.data.iter().map(|s| s.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushpull_classification() {
        let mut meta = Meta::default();
        assert!(meta.is_pushpull());

        meta.control.cmd = Command::Barrier;
        assert!(!meta.is_pushpull());

        meta.control.cmd = Command::Empty;
        meta.simple_app = true;
        assert!(!meta.is_pushpull());
    }

    #[test]
    fn segment_clone_aliases_storage() {
        let seg = Segment::from_vec(vec![1, 2, 3, 4]);
        let clone = seg.clone();
        assert_eq!(seg.as_ptr(), clone.as_ptr());
        assert_eq!(clone.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn segment_view_reads_raw_memory() {
        let backing = vec![9u8; 64];
        let view = unsafe { Segment::view(backing.as_ptr(), backing.len()) };
        assert_eq!(view.len(), 64);
        assert!(view.as_slice().iter().all(|&b| b == 9));
    }

    #[test]
    fn message_data_total() {
        let mut msg = Message::default();
        msg.data.push(Segment::from_vec(vec![0; 8]));
        msg.data.push(Segment::from_vec(vec![0; 1024]));
        msg.data.push(Segment::from_vec(vec![0; 4]));
        assert_eq!(msg.data_len_total(), 1036);
    }
}
