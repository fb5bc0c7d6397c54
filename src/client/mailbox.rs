//! The mailbox/mailman reply demultiplexer (§4.7).
//!
//! Any number of caller threads can share one [`ClientMailbox`] and call
//! [`ClientMailbox::wait_for`] concurrently. At any instant at most one of
//! them plays "mailman": it holds `queue_lock` (a role token, not a data
//! lock) and is the sole reader of the transport, matching replies to
//! waiters by `msg_id` and staging anything unclaimed in `new_mail`. Every
//! other caller registers a [`Recipient`] and sleeps on its `event` until
//! either the mailman delivers its reply directly or nominates it as the
//! next mailman.
//!
//! This is a direct, unmodified port of the algorithm in `RcmClient.c`'s
//! `RcmClient_getReturnMsg_P` — the `queue_lock` stays a literal
//! `Mutex::try_lock` role token rather than being replaced by a channel,
//! per the design note this algorithm is grounded on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::sync::Event;
use crate::transport::{Address, Transport};

struct Recipient {
    msg_id: u16,
    slot: Mutex<Option<Packet>>,
    event: Event,
}

#[derive(Default)]
struct Inbox {
    recipients: Vec<Arc<Recipient>>,
    new_mail: HashMap<u16, Packet>,
}

/// Per-client reply demultiplexer. One instance is shared by every thread
/// using the same logical client.
pub struct ClientMailbox {
    transport: Arc<dyn Transport>,
    inbox: Mutex<Inbox>,
    /// Try-lockable role token for the reader ("mailman"); never guards
    /// `inbox`'s contents (§5: "a role token, not data protection").
    queue_lock: Mutex<()>,
}

impl ClientMailbox {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        ClientMailbox {
            transport,
            inbox: Mutex::new(Inbox::default()),
            queue_lock: Mutex::new(()),
        }
    }

    pub fn local_addr(&self) -> Address {
        self.transport.local_addr()
    }

    pub fn send(&self, dst: Address, packet: &Packet) -> Result<()> {
        self.transport.send(dst, &packet.encode())
    }

    /// Blocks forever until the reply bearing `msg_id` is available, per
    /// §4.7 (the core RCM client never times out; see §5).
    pub fn wait_for(&self, msg_id: u16) -> Result<Packet> {
        self.wait_for_deadline(msg_id, None)
    }

    /// As [`ClientMailbox::wait_for`], but gives up with [`Error::Timeout`]
    /// once `deadline` passes. Used by `ResourceClient`, the one caller
    /// the design allows a timeout (§5: "Client operations can carry a
    /// timeout (resource client does; core RCM client waits forever)").
    /// A waiter that times out removes itself from `recipients`; if the
    /// mailman's reply lands a moment later it is staged in `new_mail` and
    /// simply never claimed, not specially discarded (§5).
    pub fn wait_for_deadline(&self, msg_id: u16, deadline: Option<Instant>) -> Result<Packet> {
        loop {
            let mut inbox = self.inbox.lock().unwrap();
            if let Some(pkt) = inbox.new_mail.remove(&msg_id) {
                return Ok(pkt);
            }

            match self.queue_lock.try_lock() {
                Ok(queue_token) => return self.run_mailman(inbox, queue_token, msg_id, deadline),
                Err(TryLockError::WouldBlock) => {
                    let recipient = Arc::new(Recipient {
                        msg_id,
                        slot: Mutex::new(None),
                        event: Event::new(),
                    });
                    inbox.recipients.push(Arc::clone(&recipient));
                    drop(inbox);

                    let fired = match deadline {
                        None => {
                            recipient.event.wait();
                            true
                        }
                        Some(dl) => match dl.checked_duration_since(Instant::now()) {
                            None => false,
                            Some(remaining) => recipient.event.wait_timeout(remaining),
                        },
                    };

                    let mut inbox = self.inbox.lock().unwrap();
                    let delivered = recipient.slot.lock().unwrap().take();
                    inbox.recipients.retain(|r| !Arc::ptr_eq(r, &recipient));
                    drop(inbox);

                    if let Some(pkt) = delivered {
                        return Ok(pkt);
                    }
                    if !fired {
                        return Err(Error::Timeout);
                    }
                    // nominated but not yet delivered: loop back to the top
                    // and try to become mailman ourselves (§4.7 "this
                    // handles the nomination-without-delivery case").
                }
                Err(TryLockError::Poisoned(e)) => return Err(poison_err(e)),
            }
        }
    }

    /// The mailman loop: drain the transport, routing every arrival to its
    /// waiter (or `new_mail` if none is registered yet) until our own
    /// `msg_id` shows up.
    fn run_mailman<'a>(
        &'a self,
        mut inbox: MutexGuard<'a, Inbox>,
        queue_token: MutexGuard<'a, ()>,
        msg_id: u16,
        deadline: Option<Instant>,
    ) -> Result<Packet> {
        loop {
            let bytes = match self.transport.recv(Some(Duration::ZERO)) {
                Ok((bytes, _src)) => bytes,
                Err(Error::Timeout) => {
                    drop(inbox);
                    let remaining = match deadline {
                        None => None,
                        Some(dl) => match dl.checked_duration_since(Instant::now()) {
                            None => return Err(Error::Timeout),
                            Some(remaining) => Some(remaining),
                        },
                    };
                    let blocking = self.transport.recv(remaining);
                    inbox = self.inbox.lock().unwrap();
                    match blocking {
                        Ok((bytes, _src)) => bytes,
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            };

            let decoded = match Packet::decode(&bytes) {
                Ok(p) => p,
                Err(e) => {
                    warn!("mailbox: dropping undecodable reply: {e}");
                    continue;
                }
            };

            if decoded.header.msg_id == msg_id {
                if let Some(candidate) = inbox.recipients.iter().find(|r| r.slot.lock().unwrap().is_none()) {
                    debug!("mailbox: nominating a new mailman before returning");
                    candidate.event.post();
                }
                drop(queue_token);
                drop(inbox);
                return Ok(decoded);
            }

            match inbox.recipients.iter().find(|r| r.msg_id == decoded.header.msg_id) {
                Some(recipient) => {
                    *recipient.slot.lock().unwrap() = Some(decoded);
                    recipient.event.post();
                }
                None => {
                    inbox.new_mail.insert(decoded.header.msg_id, decoded);
                }
            }
        }
    }
}

fn poison_err<T>(_e: std::sync::PoisonError<T>) -> Error {
    Error::MessageLost
}
