//! Endpoint engine: maps FIFO occupancy to TD submissions for one USB
//! endpoint, and reaps completions back into the FIFO.
//!
//! Grounded in `try_queue_bulkin`/`try_queue_bulkout`/`cancel_all` and the
//! `transfer_in_callback`/`transfer_out_callback` completion handlers in
//! `usb.c`. The USB device handle itself is a resource shared by every
//! endpoint of the interface, so it is passed in as `&mut dyn UsbTransport`
//! rather than owned here (spec.md §5, "Shared resources").

use crate::error::{Error, Result};
use crate::fifo::Fifo;
use crate::td::{TdId, TdPool, TD_SIZE, TDS_PER_ENDPOINT};
use crate::usb_transport::{
    Completion, Direction, EndpointAddress, TransferHandle, TransferKind, TransferStatus,
    UsbTransport,
};

/// Bulk-IN and bulk-OUT FIFOs per spec.md §6: IN endpoints get exactly
/// `max_payload` of headroom; OUT endpoints get one extra `max_payload`
/// chunk so a maximum-sized WRITE always has somewhere to land before the
/// previous WRITE has fully drained to the wire.
pub const MAX_PAYLOAD: usize = 0x20000;
pub const FIFO_SIZE_IN: usize = 262144;
pub const FIFO_SIZE_OUT: usize = 262144 + MAX_PAYLOAD;

pub struct Endpoint {
    pub address: EndpointAddress,
    pub kind: TransferKind,
    pub fifo: Fifo,
    tds: TdPool,
}

impl Endpoint {
    pub fn new(address: EndpointAddress, kind: TransferKind) -> Self {
        let fifo_size = match address.direction {
            Direction::In => FIFO_SIZE_IN,
            Direction::Out => FIFO_SIZE_OUT,
        };
        Endpoint {
            address,
            kind,
            fifo: Fifo::new(fifo_size),
            tds: TdPool::new(TDS_PER_ENDPOINT, TD_SIZE),
        }
    }

    pub fn queued_len(&self) -> usize {
        self.tds.queued_len()
    }

    pub fn has_queued(&self) -> bool {
        !self.tds.queued_is_empty()
    }

    /// Resolves a transport completion's handle back to the TD it belongs
    /// to, so the caller can hand it to [`Self::complete_in`] /
    /// [`Self::complete_out`].
    pub fn find_td(&self, handle: TransferHandle) -> Option<TdId> {
        self.tds.find_queued_by_handle(handle)
    }

    /// While there's a free TD and the FIFO would still have room for a
    /// full TD-sized deposit after every in-flight TD lands, submit an IN
    /// transfer. The admission check looks `td_size` bytes ahead of every
    /// outstanding TD so that a completion can never overflow the FIFO.
    pub fn try_queue_bulkin(&mut self, transport: &mut dyn UsbTransport) -> Result<()> {
        debug_assert_eq!(self.address.direction, Direction::In);

        loop {
            let fifo_left = self.fifo.vacant() as isize
                - (self.tds.queued_len() as isize) * (TD_SIZE as isize);
            if fifo_left < TD_SIZE as isize {
                break;
            }
            let Some(id) = self.tds.peek_pool_head() else {
                break;
            };

            let buf = self.tds.buffer_mut(id);
            let handle = transport.submit(self.address, self.kind, buf, TD_SIZE)?;
            self.tds.move_to_queued(id, handle);
        }

        Ok(())
    }

    /// Drains FIFO bytes into OUT TDs and submits them. Returns whether at
    /// least one TD was submitted this call (used by the caller, together
    /// with its own `try_complete` flag, to decide whether to re-check the
    /// blocked WRITE).
    pub fn try_queue_bulkout(&mut self, transport: &mut dyn UsbTransport) -> Result<bool> {
        debug_assert_eq!(self.address.direction, Direction::Out);

        let mut submitted_any = false;

        loop {
            let fill = self.fifo.fill();
            if fill == 0 {
                break;
            }
            // Fairness: don't send a short TD while another is already in
            // flight; wait for more data or for the in-flight one to land.
            if fill < TD_SIZE && !self.tds.queued_is_empty() {
                break;
            }
            let Some(id) = self.tds.peek_pool_head() else {
                break;
            };

            let mut tmp = vec![0u8; TD_SIZE];
            let len = self.fifo.read(&mut tmp);
            let buf = self.tds.buffer_mut(id);
            buf[..len].copy_from_slice(&tmp[..len]);

            let handle = transport.submit(self.address, self.kind, buf, len)?;
            self.tds.move_to_queued(id, handle);
            submitted_any = true;
        }

        Ok(submitted_any)
    }

    /// Requests cancellation of every in-flight TD. `NOT_FOUND`-equivalent
    /// outcomes are swallowed by the transport; later arriving as a
    /// `Cancelled` completion.
    pub fn cancel_all(&mut self, transport: &mut dyn UsbTransport) -> Result<()> {
        for handle in self.tds.queued_handles() {
            transport.cancel(handle)?;
        }
        Ok(())
    }

    /// Handles a completed IN transfer: the TD returns to the pool first
    /// (so a nested `try_queue_bulkin` sees it), then its payload is
    /// copied into the FIFO. Returns `Ok(Some(bytes_deposited))` on a
    /// normal completion, `Ok(None)` if the transfer was cancelled (no
    /// further action), or an error if the status is otherwise fatal, or
    /// if the FIFO somehow has no room (an admission-rule violation).
    pub fn complete_in(&mut self, id: TdId, completion: Completion) -> Result<Option<usize>> {
        let payload = if completion.status == TransferStatus::Completed {
            Some(self.tds.buffer(id)[..completion.actual_length].to_vec())
        } else {
            None
        };
        self.tds.move_to_pool(id);

        match completion.status {
            TransferStatus::Cancelled => Ok(None),
            TransferStatus::Error => Err(Error::Fatal(format!(
                "unexpected status on BULK IN endpoint {}",
                self.address.number
            ))),
            TransferStatus::Completed => {
                let payload = payload.unwrap();
                let accepted = self.fifo.write(&payload);
                if accepted != payload.len() {
                    return Err(Error::Fatal(format!(
                        "overflow on BULK IN FIFO of endpoint {}",
                        self.address.number
                    )));
                }
                Ok(Some(accepted))
            }
        }
    }

    /// Handles a completed OUT transfer: TD returns to the pool; a short
    /// completion (fewer bytes sent than requested) on an otherwise
    /// successful status is fatal, matching `usb.c`'s
    /// `transfer->actual_length != transfer->length` check.
    pub fn complete_out(&mut self, id: TdId, completion: Completion) -> Result<()> {
        self.tds.move_to_pool(id);

        match completion.status {
            TransferStatus::Cancelled => Ok(()),
            TransferStatus::Error => Err(Error::Fatal(format!(
                "unexpected status on BULK OUT endpoint {}",
                self.address.number
            ))),
            TransferStatus::Completed => {
                if completion.actual_length != completion.requested_length {
                    return Err(Error::Fatal(format!(
                        "BULK OUT endpoint {}: attempted to send {} bytes, sent only {}",
                        self.address.number, completion.requested_length, completion.actual_length
                    )));
                }
                Ok(())
            }
        }
    }
}
