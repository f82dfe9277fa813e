// src/comm/mailbox.rs
/*!
In-process point-to-point messaging between partitions.

Every partition owns one mailbox. A send deposits a byte buffer keyed by
`(source rank, tag)` into the destination's mailbox and returns immediately; a
receive blocks until the matching key shows up, the optional exchange deadline
passes, or the communicator is poisoned because some partition died.

Collectives are built from the same primitives and always combine
contributions in rank order, so every partition computes bit-identical results.
*/

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{fatal, LatticeError};

/// Message identity. Halo tags carry a per-(field, direction, parity)
/// generation so that back-to-back exchanges never alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Halo { field: u64, dir: usize, parity: u8, generation: u64 },
    Collective { seq: u64 },
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Halo { field, dir, parity, generation } => {
                write!(f, "halo field={field} dir={dir} parity={parity:#04b} gen={generation}")
            }
            Tag::Collective { seq } => write!(f, "collective seq={seq}"),
        }
    }
}

#[derive(Default)]
struct Mailbox {
    slots: Mutex<AHashMap<(usize, Tag), Vec<u8>>>,
    ready: Condvar,
}

pub struct Communicator {
    boxes: Vec<Mailbox>,
    poisoned: AtomicBool,
    timeout: Option<Duration>,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("size", &self.boxes.len())
            .field("poisoned", &self.is_poisoned())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Communicator {
    /// `timeout: None` lets receives block until the message arrives or a peer dies.
    pub fn new(size: usize, timeout: Option<Duration>) -> Self {
        Self {
            boxes: (0..size).map(|_| Mailbox::default()).collect(),
            poisoned: AtomicBool::new(false),
            timeout,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.boxes.len()
    }

    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Deposit `bytes` for `to`. Never blocks. A second message with the same
    /// `(from, tag)` before the first was received is a protocol violation.
    pub fn send(&self, from: usize, to: usize, tag: Tag, bytes: Vec<u8>) {
        let mailbox = &self.boxes[to];
        let mut slots = mailbox.slots.lock();
        if slots.contains_key(&(from, tag)) {
            drop(slots);
            fatal(LatticeError::Protocol(format!(
                "duplicate message from partition {from} to {to} ({tag})"
            )));
        }
        trace!(from, to, %tag, bytes = bytes.len(), "send");
        slots.insert((from, tag), bytes);
        mailbox.ready.notify_all();
    }

    /// Block `at` until the message `(from, tag)` arrives.
    pub fn recv(&self, at: usize, from: usize, tag: Tag) -> Vec<u8> {
        let mailbox = &self.boxes[at];
        let start = Instant::now();
        let deadline = self.timeout.map(|t| start + t);
        let mut slots = mailbox.slots.lock();
        loop {
            if let Some(bytes) = slots.remove(&(from, tag)) {
                trace!(at, from, %tag, bytes = bytes.len(), "recv");
                return bytes;
            }
            if self.is_poisoned() {
                drop(slots);
                fatal(LatticeError::PeerAborted);
            }
            match deadline {
                Some(deadline) => {
                    if mailbox.ready.wait_until(&mut slots, deadline).timed_out()
                        && !slots.contains_key(&(from, tag))
                    {
                        drop(slots);
                        fatal(LatticeError::Timeout {
                            from,
                            tag: tag.to_string(),
                            waited_ms: start.elapsed().as_millis() as u64,
                        });
                    }
                }
                None => mailbox.ready.wait(&mut slots),
            }
        }
    }

    /// Number of undelivered messages waiting at `at`.
    pub fn pending(&self, at: usize) -> usize {
        self.boxes[at].slots.lock().len()
    }

    /// Wake every blocked receiver and make all later receives fail.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
        for mailbox in &self.boxes {
            let _guard = mailbox.slots.lock();
            mailbox.ready.notify_all();
        }
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    // --------------------------- collectives ---------------------------

    /// Every rank receives every rank's buffer, indexed by rank.
    pub fn allgather(&self, rank: usize, seq: u64, bytes: Vec<u8>) -> Vec<Vec<u8>> {
        let tag = Tag::Collective { seq };
        for to in (0..self.size()).filter(|&r| r != rank) {
            self.send(rank, to, tag, bytes.clone());
        }
        let mut own = Some(bytes);
        (0..self.size())
            .map(|from| if from == rank { own.take().unwrap_or_default() } else { self.recv(rank, from, tag) })
            .collect()
    }

    /// Element-wise sum of `local` over all ranks, added in rank order.
    pub fn allreduce_sum(&self, rank: usize, seq: u64, local: &[f64]) -> Vec<f64> {
        let parts = self.allgather(rank, seq, bytemuck::cast_slice(local).to_vec());
        let mut total = vec![0.0f64; local.len()];
        for part in &parts {
            check_len(part.len(), local.len() * 8);
            let values: Vec<f64> = bytemuck::pod_collect_to_vec(part);
            for (t, v) in total.iter_mut().zip(values) {
                *t += v;
            }
        }
        total
    }

    /// `root` supplies the payload, every rank gets a copy.
    pub fn broadcast(&self, rank: usize, root: usize, seq: u64, bytes: Option<Vec<u8>>) -> Vec<u8> {
        let tag = Tag::Collective { seq };
        if rank == root {
            let Some(bytes) = bytes else {
                fatal(LatticeError::Protocol(format!("broadcast root {root} supplied no payload")));
            };
            for to in (0..self.size()).filter(|&r| r != root) {
                self.send(root, to, tag, bytes.clone());
            }
            bytes
        } else {
            self.recv(rank, root, tag)
        }
    }

    /// Empty-payload rendezvous of every rank.
    pub fn barrier(&self, rank: usize, seq: u64) {
        let _ = self.allgather(rank, seq, Vec::new());
    }
}

#[inline]
fn check_len(actual: usize, expected: usize) {
    if actual != expected {
        fatal(LatticeError::LayoutMismatch { expected, actual });
    }
}
