//! Minimal message-passing layer for the SPMD mesh core, encapsulated by a
//! [`Communicator`] trait. Implementors only need tagged `send` and `recv`
//! operations for a transport; the trait provides the collective operations
//! (all-gather, all-reduce) the mesh uses on top of them.
//!
//! Two transports are included: [`SoloComm`] for single-process runs and
//! [`ThreadComm`], a channel-backed full mesh of in-process ranks used by
//! the multi-rank tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Tag reserved for the built-in collectives. Point-to-point traffic (AMR
/// migration, checkpoint funneling) must use tags below this value.
const COLLECTIVE: u64 = u64::MAX;

/// Interface for a group of processes that exchange messages. The
/// underlying transport can in principle be channels, TCP, or a higher
/// level abstraction like MPI.
pub trait Communicator: Send {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of peer processes in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to post a tagged message to a peer. This method
    /// must return immediately; it is not allowed to block until a matching
    /// receive is posted.
    fn send(&self, rank: usize, tag: u64, message: Vec<u8>);

    /// Must be implemented to receive the message with the given tag from
    /// the given peer, blocking until it arrives. Messages with other tags
    /// must be held back for later receives, not dropped.
    fn recv(&self, rank: usize, tag: u64) -> Vec<u8>;

    /// Gathers one payload from every rank, in rank order. Collective: all
    /// ranks must call with their own contribution.
    fn all_gather(&self, message: &[u8]) -> Vec<Vec<u8>> {
        for peer in 0..self.size() {
            if peer != self.rank() {
                self.send(peer, COLLECTIVE, message.to_vec());
            }
        }

        (0..self.size())
            .map(|peer| {
                if peer == self.rank() {
                    message.to_vec()
                } else {
                    self.recv(peer, COLLECTIVE)
                }
            })
            .collect()
    }

    /// Global minimum of one scalar per rank.
    fn all_reduce_min(&self, value: f64) -> f64 {
        self.all_gather(&value.to_le_bytes())
            .iter()
            .map(|bytes| decode_f64s(bytes)[0])
            .fold(f64::INFINITY, f64::min)
    }

    /// Elementwise global sum of a fixed-length vector per rank.
    fn all_reduce_sum(&self, values: &[f64]) -> Vec<f64> {
        let mut result = vec![0.0; values.len()];
        for bytes in self.all_gather(&encode_f64s(values)) {
            for (acc, v) in result.iter_mut().zip(decode_f64s(&bytes)) {
                *acc += v;
            }
        }
        result
    }

    /// Synchronization point with no payload.
    fn barrier(&self) {
        let _ = self.all_gather(&[]);
    }
}

pub(crate) fn encode_f64s(values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_f64s(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| f64::from_le_bytes(chunk.try_into().expect("8-byte chunk")))
        .collect()
}

/// Trivial communicator for a single-process run. Loop-back messages are
/// queued per tag so the collective and migration code paths stay identical
/// to the multi-rank case.
#[derive(Default)]
pub struct SoloComm {
    queue: Mutex<VecDeque<(u64, Vec<u8>)>>,
}

impl SoloComm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Communicator for SoloComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, rank: usize, tag: u64, message: Vec<u8>) {
        assert_eq!(rank, 0, "solo communicator has a single rank");
        self.queue
            .lock()
            .expect("solo queue poisoned")
            .push_back((tag, message));
    }

    fn recv(&self, rank: usize, tag: u64) -> Vec<u8> {
        assert_eq!(rank, 0, "solo communicator has a single rank");
        let mut queue = self.queue.lock().expect("solo queue poisoned");
        let index = queue
            .iter()
            .position(|(t, _)| *t == tag)
            .expect("receive posted with no matching loop-back send");
        queue.remove(index).map(|(_, message)| message).expect("indexed entry")
    }
}

/// A full mesh of in-process ranks connected by unbounded channels. Sends
/// are eager and never block; receives match on (peer, tag) and hold back
/// anything that arrives out of order.
pub struct ThreadComm {
    rank: usize,
    peers: Vec<Sender<(usize, u64, Vec<u8>)>>,
    inbox: Receiver<(usize, u64, Vec<u8>)>,
    held: Mutex<Vec<(usize, u64, Vec<u8>)>>,
}

impl ThreadComm {
    /// Creates `size` connected endpoints, one per rank. Each endpoint is
    /// meant to move into its own thread of control.
    pub fn connect(size: usize) -> Vec<ThreadComm> {
        let (senders, inboxes): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ThreadComm {
                rank,
                peers: senders.clone(),
                inbox,
                held: Mutex::new(Vec::new()),
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, tag: u64, message: Vec<u8>) {
        self.peers[rank]
            .send((self.rank, tag, message))
            .expect("peer rank hung up");
    }

    fn recv(&self, rank: usize, tag: u64) -> Vec<u8> {
        {
            // Messages from one peer with the same tag must come back in
            // send order, so removal has to preserve the buffer order.
            let mut held = self.held.lock().expect("held buffer poisoned");
            if let Some(index) = held
                .iter()
                .position(|(src, t, _)| *src == rank && *t == tag)
            {
                return held.remove(index).2;
            }
        }

        loop {
            let (src, t, message) = self.inbox.recv().expect("peer rank hung up");
            if src == rank && t == tag {
                return message;
            }
            self.held
                .lock()
                .expect("held buffer poisoned")
                .push((src, t, message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn gather_and_reduce_across_ranks() {
        let comms = ThreadComm::connect(3);

        thread::scope(|scope| {
            for comm in comms {
                scope.spawn(move || {
                    let gathered = comm.all_gather(&[comm.rank() as u8]);
                    assert_eq!(gathered, vec![vec![0], vec![1], vec![2]]);

                    let min = comm.all_reduce_min(10.0 - comm.rank() as f64);
                    assert_eq!(min, 8.0);

                    let sum = comm.all_reduce_sum(&[1.0, comm.rank() as f64]);
                    assert_eq!(sum, vec![3.0, 3.0]);
                });
            }
        });
    }

    #[test]
    fn out_of_order_tags_are_held_back() {
        let mut comms = ThreadComm::connect(2);
        let b = comms.pop().expect("two endpoints");
        let a = comms.pop().expect("two endpoints");

        a.send(1, 7, vec![7]);
        a.send(1, 3, vec![3]);

        // Rank 1 asks for the later tag first.
        assert_eq!(b.recv(0, 3), vec![3]);
        assert_eq!(b.recv(0, 7), vec![7]);
    }

    #[test]
    fn same_tag_messages_stay_in_send_order() {
        let mut comms = ThreadComm::connect(2);
        let b = comms.pop().expect("two endpoints");
        let a = comms.pop().expect("two endpoints");

        a.send(1, 5, vec![50]);
        a.send(1, 7, vec![1]);
        a.send(1, 7, vec![2]);
        a.send(1, 9, vec![90]);

        // Draining the held buffer out of order must not swap the two
        // tag-7 messages.
        assert_eq!(b.recv(0, 9), vec![90]);
        assert_eq!(b.recv(0, 5), vec![50]);
        assert_eq!(b.recv(0, 7), vec![1]);
        assert_eq!(b.recv(0, 7), vec![2]);
    }

    #[test]
    fn solo_loop_back() {
        let comm = SoloComm::new();
        comm.send(0, 5, vec![1, 2]);
        comm.send(0, 6, vec![3]);
        assert_eq!(comm.recv(0, 6), vec![3]);
        assert_eq!(comm.recv(0, 5), vec![1, 2]);
        assert_eq!(comm.all_reduce_min(2.5), 2.5);
    }
}
