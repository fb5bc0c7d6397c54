//! Per-job ordering (§4.5).
//!
//! A `JobStream` is a FIFO of packets sharing a 16-bit job id; the registry
//! guarantees that at most one packet from a given job is ever queued or
//! executing at a time, so handlers observe a job's packets in send order
//! (P6) without the caller needing any lock beyond sending in order.

use std::collections::{HashMap, VecDeque};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::transport::Address;
use crate::JOB_ID_DISCRETE;

/// A packet paired with the address its reply must go to. The wire header
/// carries no address field (§6); the dispatcher tracks it out of band for
/// exactly as long as the packet is in flight.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub packet: Packet,
    pub reply_addr: Address,
}

struct JobStream {
    pending: VecDeque<Inbound>,
    /// `false` while one packet from this job is queued or executing.
    empty: bool,
}

/// Allocates job ids and serialises delivery within each one.
pub struct JobRegistry {
    next_job_id: u16,
    jobs: HashMap<u16, JobStream>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        JobRegistry {
            next_job_id: 0xFFFF,
            jobs: HashMap::new(),
        }
    }

    /// Allocates a fresh job id, never `DISCRETE` and never one already in
    /// use. Wraps at `0xFFFF`; gives up after a full scan of the 16-bit
    /// space (P3).
    pub fn acquire(&mut self) -> Result<u16> {
        for _ in 0..=0xFFFFu32 {
            self.next_job_id = if self.next_job_id == 0xFFFF {
                1
            } else {
                self.next_job_id + 1
            };
            let candidate = self.next_job_id;
            if candidate != JOB_ID_DISCRETE && !self.jobs.contains_key(&candidate) {
                self.jobs.insert(
                    candidate,
                    JobStream {
                        pending: VecDeque::new(),
                        empty: true,
                    },
                );
                return Ok(candidate);
            }
        }
        Err(Error::JobIdExhausted)
    }

    /// Releases a job id, returning every packet still waiting in its
    /// queue so the caller can reply to each with `UNPROCESSED` (§3
    /// `JobStream` lifecycle, S5).
    pub fn release(&mut self, job_id: u16) -> Result<Vec<Inbound>> {
        let stream = self.jobs.remove(&job_id).ok_or(Error::JobNotFound)?;
        Ok(stream.pending.into_iter().collect())
    }

    /// Routes one arriving packet (§4.5 `dispatch`):
    ///   - `DISCRETE` packets are always ready to run immediately.
    ///   - Job packets run immediately only if their stream is currently
    ///     empty; otherwise they wait in `pending`.
    ///
    /// Returns `Some(inbound)` when the packet (the same one passed in, for
    /// a discrete job, or this one if its stream was empty) is ready to be
    /// posted to a pool right now.
    pub fn dispatch(&mut self, inbound: Inbound) -> Result<Option<Inbound>> {
        let job_id = inbound.packet.header.job_id();
        if job_id == JOB_ID_DISCRETE {
            return Ok(Some(inbound));
        }
        let stream = self.jobs.get_mut(&job_id).ok_or(Error::JobNotFound)?;
        if stream.empty {
            stream.empty = false;
            Ok(Some(inbound))
        } else {
            debug!("job {job_id}: queueing behind in-flight packet");
            stream.pending.push_back(inbound);
            Ok(None)
        }
    }

    /// Every job id currently registered, used by server shutdown to flush
    /// each stream's pending packets (P9, S5).
    pub fn ids(&self) -> Vec<u16> {
        self.jobs.keys().copied().collect()
    }

    /// Whether `job_id` is currently acquired. `DISCRETE` is never
    /// considered registered, since it names no stream.
    pub fn contains(&self, job_id: u16) -> bool {
        job_id != JOB_ID_DISCRETE && self.jobs.contains_key(&job_id)
    }

    /// Called once a job packet has finished executing. Pops the next
    /// waiting packet for that job, if any, and marks the stream empty
    /// again if there was none (§4.4 worker loop step, §3 `JobStream`
    /// invariant).
    pub fn complete(&mut self, job_id: u16) -> Option<Inbound> {
        if job_id == JOB_ID_DISCRETE {
            return None;
        }
        match self.jobs.get_mut(&job_id) {
            Some(stream) => match stream.pending.pop_front() {
                Some(next) => Some(next),
                None => {
                    stream.empty = true;
                    None
                }
            },
            None => {
                // job was released while its packet was executing
                warn!("job {job_id}: completed after release");
                None
            }
        }
    }
}
