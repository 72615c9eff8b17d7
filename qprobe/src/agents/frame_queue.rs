//! Priority queue of control frames waiting for a packet.
//!
//! Frames are kept per requested level (virtual levels included) and leave
//! in (priority, arrival) order. A pull takes frames while they fit and
//! stops at the first one that doesn't, so lower-priority frames never
//! overtake it.

use super::{FrameRequest, QueueCommand, SenderHandle, Shutdown};
use qprobe_quic::{EncryptionLevel, Frame};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug)]
struct Entry {
    priority: u8,
    seq: u64,
    frame: Frame,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: the lowest (priority, seq) is the greatest entry
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded per-level frame queue
#[derive(Debug)]
pub struct FrameQueue {
    levels: BTreeMap<EncryptionLevel, BinaryHeap<Entry>>,
    capacity: usize,
    len: usize,
    seq: u64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            levels: BTreeMap::new(),
            capacity: capacity.max(1),
            len: 0,
            seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    pub fn push(&mut self, level: EncryptionLevel, frame: Frame) {
        self.seq += 1;
        let entry = Entry {
            priority: frame.priority(),
            seq: self.seq,
            frame,
        };
        self.levels.entry(level).or_default().push(entry);
        self.len += 1;
    }

    /// Bytes queued at exactly `level`
    pub fn pending_bytes(&self, level: EncryptionLevel) -> usize {
        self.levels
            .get(&level)
            .map_or(0, |heap| heap.iter().map(|e| e.frame.wire_len()).sum())
    }

    /// Take frames for `level` while they fit in `available` bytes
    ///
    /// When nothing was placed in the packet yet, a head frame larger than
    /// the whole packet can never be sent and is dropped.
    pub fn pop_fitting(
        &mut self,
        level: EncryptionLevel,
        mut available: usize,
        packet_empty: bool,
    ) -> Vec<Frame> {
        let Some(heap) = self.levels.get_mut(&level) else {
            return Vec::new();
        };

        let mut frames = Vec::new();
        while let Some(head) = heap.peek() {
            let len = head.frame.wire_len();
            let fits = len <= available;
            if !fits && !(frames.is_empty() && packet_empty) {
                break;
            }
            let Some(entry) = heap.pop() else {
                break;
            };
            self.len -= 1;
            if fits {
                available -= len;
                frames.push(entry.frame);
            } else {
                warn!(
                    ?level,
                    frame = entry.frame.name(),
                    len,
                    available,
                    "dropping frame larger than a packet"
                );
            }
        }
        if heap.is_empty() {
            self.levels.remove(&level);
        }
        frames
    }

    pub fn clear(&mut self) {
        self.levels.clear();
        self.len = 0;
    }
}

/// Agent owning the [`FrameQueue`]
pub struct FrameQueueAgent {
    queue: FrameQueue,
    commands: mpsc::Receiver<QueueCommand>,
    requests: mpsc::Receiver<FrameRequest>,
    sender: SenderHandle,
    shutdown: Shutdown,
}

impl FrameQueueAgent {
    pub fn new(
        capacity: usize,
        commands: mpsc::Receiver<QueueCommand>,
        requests: mpsc::Receiver<FrameRequest>,
        sender: SenderHandle,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            queue: FrameQueue::new(capacity),
            commands,
            requests,
            sender,
            shutdown,
        }
    }

    pub async fn run(self) {
        let Self {
            mut queue,
            mut commands,
            mut requests,
            sender,
            mut shutdown,
        } = self;

        loop {
            let accepting = !queue.is_full();
            select! {
                _ = shutdown.recv() => break,

                command = commands.recv(), if accepting => match command {
                    Some(QueueCommand::Push { level, frame }) => {
                        let bytes = frame.wire_len();
                        queue.push(level, frame);
                        sender.prepare(level, bytes);
                    }
                    Some(QueueCommand::Clear) => {
                        debug!(dropped = queue.len(), "frame queue cleared");
                        queue.clear();
                    }
                    None => break,
                },

                request = requests.recv() => match request {
                    Some(request) => {
                        let level = request.level;
                        let frames = queue.pop_fitting(level, request.available, request.packet_empty);
                        let _ = request.reply.send(frames);
                        let left = queue.pending_bytes(level);
                        if left > 0 {
                            sender.prepare(level, left);
                        }
                    }
                    None => break,
                },
            }
        }

        debug!(queued = queue.len(), "frame queue stopped");
    }
}
