//! Transfer descriptor pool: a fixed-size arena of preallocated buffers,
//! threaded through two intrusive doubly-linked lists (`pool`, `queued`).
//!
//! The original C (`usbpiper.h`/`usb.c`) links `struct pipertd` nodes
//! directly via `prev`/`next` pointers, with the list head being a sentinel
//! node (`head->next == head` means empty). Per the "intrusive lists vs
//! owning containers" design note, this is reimplemented as a stable-index
//! arena: TDs never move in memory, lists are threaded through `TdId`
//! links stored in each slot, and a TD's back-pointer to its endpoint is
//! implicit (it's just "which endpoint's arena this id came from"), so
//! there is no cyclic ownership to manage.

/// Fixed payload size of a single transfer descriptor's buffer.
pub const TD_SIZE: usize = 65536;

/// Number of TDs allocated per endpoint.
pub const TDS_PER_ENDPOINT: usize = 10;

/// Index into a [`TdPool`]'s arena. Stable for the lifetime of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TdId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListName {
    Pool,
    Queued,
}

struct Slot {
    buf: Vec<u8>,
    prev: Option<TdId>,
    next: Option<TdId>,
    list: ListName,
    /// Set while queued with the USB transport; cleared when it migrates
    /// back to the pool list.
    transfer_handle: Option<crate::usb_transport::TransferHandle>,
}

struct List {
    head: Option<TdId>,
    tail: Option<TdId>,
    len: usize,
}

impl List {
    fn empty() -> Self {
        List {
            head: None,
            tail: None,
            len: 0,
        }
    }
}

/// Owns the fixed-count array of TDs for one endpoint, plus the pool/queued
/// list heads.
pub struct TdPool {
    slots: Vec<Slot>,
    pool: List,
    queued: List,
}

impl TdPool {
    pub fn new(count: usize, td_size: usize) -> Self {
        let mut slots = Vec::with_capacity(count);
        let mut pool = List::empty();

        for i in 0..count {
            slots.push(Slot {
                buf: vec![0u8; td_size],
                prev: None,
                next: None,
                list: ListName::Pool,
                transfer_handle: None,
            });
            Self::list_push_back(&mut pool, &mut slots, TdId(i as u32));
        }

        TdPool {
            slots,
            pool,
            queued: List::empty(),
        }
    }

    fn list_push_back(list: &mut List, slots: &mut [Slot], id: TdId) {
        slots[id.0 as usize].prev = list.tail;
        slots[id.0 as usize].next = None;
        match list.tail {
            Some(tail) => slots[tail.0 as usize].next = Some(id),
            None => list.head = Some(id),
        }
        list.tail = Some(id);
        list.len += 1;
    }

    fn list_remove(list: &mut List, slots: &mut [Slot], id: TdId) {
        let prev = slots[id.0 as usize].prev;
        let next = slots[id.0 as usize].next;

        match prev {
            Some(p) => slots[p.0 as usize].next = next,
            None => list.head = next,
        }
        match next {
            Some(n) => slots[n.0 as usize].prev = prev,
            None => list.tail = prev,
        }

        slots[id.0 as usize].prev = None;
        slots[id.0 as usize].next = None;
        list.len -= 1;
    }

    pub fn pool_is_empty(&self) -> bool {
        self.pool.len == 0
    }

    pub fn queued_is_empty(&self) -> bool {
        self.queued.len == 0
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len
    }

    /// Takes the head of the pool list, if any, without moving it yet.
    pub fn peek_pool_head(&self) -> Option<TdId> {
        self.pool.head
    }

    pub fn buffer_mut(&mut self, id: TdId) -> &mut [u8] {
        &mut self.slots[id.0 as usize].buf
    }

    pub fn buffer(&self, id: TdId) -> &[u8] {
        &self.slots[id.0 as usize].buf
    }

    /// Moves `id` from the pool list to the tail of the queued list,
    /// recording the transport's transfer handle for it.
    pub fn move_to_queued(&mut self, id: TdId, handle: crate::usb_transport::TransferHandle) {
        debug_assert_eq!(self.slots[id.0 as usize].list, ListName::Pool);
        Self::list_remove(&mut self.pool, &mut self.slots, id);
        self.slots[id.0 as usize].list = ListName::Queued;
        self.slots[id.0 as usize].transfer_handle = Some(handle);
        Self::list_push_back(&mut self.queued, &mut self.slots, id);
    }

    /// Moves `id` from the queued list back to the tail of the pool list.
    /// Matches the original's "move to pool before processing payload"
    /// ordering — callers must call this before touching the TD's buffer.
    pub fn move_to_pool(&mut self, id: TdId) {
        debug_assert_eq!(self.slots[id.0 as usize].list, ListName::Queued);
        Self::list_remove(&mut self.queued, &mut self.slots, id);
        self.slots[id.0 as usize].list = ListName::Pool;
        self.slots[id.0 as usize].transfer_handle = None;
        Self::list_push_back(&mut self.pool, &mut self.slots, id);
    }

    /// Iterates the queued list's transfer handles, for `cancel_all`.
    pub fn queued_handles(&self) -> Vec<crate::usb_transport::TransferHandle> {
        let mut out = Vec::with_capacity(self.queued.len);
        let mut cur = self.queued.head;
        while let Some(id) = cur {
            if let Some(h) = self.slots[id.0 as usize].transfer_handle {
                out.push(h);
            }
            cur = self.slots[id.0 as usize].next;
        }
        out
    }

    /// Finds the queued TD carrying `handle`, if any. Used by the event
    /// loop to turn a transport completion back into a TD to reap.
    pub fn find_queued_by_handle(&self, handle: crate::usb_transport::TransferHandle) -> Option<TdId> {
        let mut cur = self.queued.head;
        while let Some(id) = cur {
            if self.slots[id.0 as usize].transfer_handle == Some(handle) {
                return Some(id);
            }
            cur = self.slots[id.0 as usize].next;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb_transport::TransferHandle;

    #[test]
    fn starts_full_in_pool() {
        let pool = TdPool::new(TDS_PER_ENDPOINT, TD_SIZE);
        assert!(!pool.pool_is_empty());
        assert!(pool.queued_is_empty());
        assert_eq!(pool.queued_len(), 0);
    }

    #[test]
    fn migrates_between_lists() {
        let mut pool = TdPool::new(2, 16);
        let a = pool.peek_pool_head().unwrap();
        pool.move_to_queued(a, TransferHandle::from_raw(1));
        assert_eq!(pool.queued_len(), 1);
        assert!(!pool.pool_is_empty()); // one TD left in pool

        let b = pool.peek_pool_head().unwrap();
        assert_ne!(a.0, b.0);
        pool.move_to_queued(b, TransferHandle::from_raw(2));
        assert!(pool.pool_is_empty());
        assert_eq!(pool.queued_len(), 2);

        pool.move_to_pool(a);
        assert!(!pool.pool_is_empty());
        assert_eq!(pool.queued_len(), 1);
    }

    #[test]
    fn queued_handles_in_submission_order() {
        let mut pool = TdPool::new(3, 16);
        let ids: Vec<_> = (0..3)
            .map(|_| pool.peek_pool_head().unwrap())
            .inspect(|id| pool.move_to_queued(*id, TransferHandle::from_raw(id.0 as u64)))
            .collect();
        let handles = pool.queued_handles();
        assert_eq!(handles.len(), 3);
        for (id, h) in ids.iter().zip(handles.iter()) {
            assert_eq!(h.raw(), id.0 as u64);
        }
    }
}
