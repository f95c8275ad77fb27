//! Requests awaiting a response.
//!
//! Entries live in a slot table. A request id is the slot index in the low
//! 16 bits and the slot's generation in the high 16 bits, so a late response
//! for a reused slot never completes the wrong caller. Each entry may carry a
//! timer; the response and the timer race to remove the entry and only the
//! first removal has any effect.

use crate::error::{ProtocolError, Result};
use crate::utils::metrics::global_metrics;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Slot indices must fit the low half of a request id.
pub const MAX_SLOTS: usize = 1 << 16;

struct Entry<T> {
    sender: oneshot::Sender<Result<T>>,
    timer: Option<AbortHandle>,
}

struct Slot<T> {
    generation: u16,
    entry: Option<Entry<T>>,
}

struct Table<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
    len: usize,
}

impl<T> Table<T> {
    fn remove(&mut self, request_id: u32) -> Option<Entry<T>> {
        let index = (request_id & 0xFFFF) as usize;
        let generation = (request_id >> 16) as u16;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = next_generation(slot.generation);
        self.free.push(index as u16);
        self.len -= 1;
        Some(entry)
    }
}

// Generation 0 is skipped so that no request id is ever 0.
fn next_generation(generation: u16) -> u16 {
    match generation.wrapping_add(1) {
        0 => 1,
        g => g,
    }
}

/// A waiter for one response.
#[derive(Debug)]
pub struct PendingResponse<T> {
    request_id: u32,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> PendingResponse<T> {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Waits for the response; a dropped entry reads as `ConnectionClosed`.
    pub async fn wait(self) -> Result<T> {
        self.receiver
            .await
            .unwrap_or(Err(ProtocolError::ConnectionClosed))
    }
}

pub struct PendingRequests<T> {
    table: Arc<Mutex<Table<T>>>,
    capacity: usize,
}

impl<T> Clone for PendingRequests<T> {
    fn clone(&self) -> Self {
        PendingRequests {
            table: self.table.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Send + 'static> PendingRequests<T> {
    pub fn new(capacity: usize) -> Self {
        PendingRequests {
            table: Arc::new(Mutex::new(Table {
                slots: Vec::new(),
                free: Vec::new(),
                len: 0,
            })),
            capacity: capacity.clamp(1, MAX_SLOTS),
        }
    }

    /// Allocates a request id. With a `timeout`, the entry fails with
    /// [`ProtocolError::Timeout`] unless completed first; this needs a Tokio
    /// runtime.
    pub fn register(&self, timeout: Option<Duration>) -> Result<PendingResponse<T>> {
        let (sender, receiver) = oneshot::channel();
        let request_id = {
            let mut table = self.table.lock();
            let index = match table.free.pop() {
                Some(index) => index as usize,
                None if table.slots.len() < self.capacity => {
                    table.slots.push(Slot {
                        generation: 1,
                        entry: None,
                    });
                    table.slots.len() - 1
                }
                None => {
                    return Err(ProtocolError::Custom(format!(
                        "too many pending requests ({})",
                        self.capacity
                    )))
                }
            };
            table.len += 1;
            let slot = &mut table.slots[index];
            slot.entry = Some(Entry {
                sender,
                timer: None,
            });
            (u32::from(slot.generation) << 16) | index as u32
        };

        if let Some(timeout) = timeout {
            let weak = Arc::downgrade(&self.table);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                fire_timeout(weak, request_id);
            });
            let mut table = self.table.lock();
            let index = (request_id & 0xFFFF) as usize;
            match table.slots.get_mut(index) {
                Some(slot) if slot.generation == (request_id >> 16) as u16 => {
                    if let Some(entry) = slot.entry.as_mut() {
                        entry.timer = Some(timer.abort_handle());
                    }
                }
                // Completed before the timer was attached
                _ => timer.abort(),
            }
        }

        trace!(request_id, "Registered pending request");
        Ok(PendingResponse {
            request_id,
            receiver,
        })
    }

    /// Completes the entry for `request_id`. Returns false if it was already
    /// completed, timed out, or never existed.
    pub fn complete(&self, request_id: u32, result: Result<T>) -> bool {
        let entry = self.table.lock().remove(request_id);
        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                match &result {
                    Ok(_) => global_metrics().request_completed(),
                    Err(ProtocolError::Timeout) => global_metrics().request_timed_out(),
                    Err(_) => global_metrics().request_failed(),
                }
                let _ = entry.sender.send(result);
                true
            }
            None => {
                debug!(request_id, "No pending request for response");
                false
            }
        }
    }

    /// Removes the entry without notifying its waiter.
    pub fn cancel(&self, request_id: u32) -> bool {
        match self.table.lock().remove(request_id) {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Fails every entry with `error` and empties the table.
    pub fn fail_all(&self, error: ProtocolError) -> usize {
        let entries: Vec<Entry<T>> = {
            let mut table = self.table.lock();
            let ids: Vec<u32> = table
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.entry.is_some())
                .map(|(index, slot)| (u32::from(slot.generation) << 16) | index as u32)
                .collect();
            ids.into_iter().filter_map(|id| table.remove(id)).collect()
        };
        let count = entries.len();
        for entry in entries {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            global_metrics().request_failed();
            let _ = entry.sender.send(Err(error.clone()));
        }
        if count > 0 {
            debug!(count, %error, "Failed pending requests");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.table.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn fire_timeout<T>(table: Weak<Mutex<Table<T>>>, request_id: u32) {
    let Some(table) = table.upgrade() else {
        return;
    };
    let entry = table.lock().remove(request_id);
    if let Some(entry) = entry {
        debug!(request_id, "Request timed out");
        global_metrics().request_timed_out();
        let _ = entry.sender.send(Err(ProtocolError::Timeout));
    }
}

impl<T> std::fmt::Debug for PendingRequests<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("len", &self.table.lock().len)
            .field("capacity", &self.capacity)
            .finish()
    }
}
