//! The boundary between the endpoint engine and whatever USB access
//! library actually talks to the device.
//!
//! USB device discovery, interface claiming and kernel-driver detachment
//! are out of scope for the core (spec.md §1): the engine is handed an
//! opened interface and drives transfers through this trait only. This
//! mirrors how `usbfs-rs`'s `AsyncDevice` takes ownership of `Transfer`
//! objects for the duration of a submit/reap cycle, and how the original
//! C's `usb.c` treats `libusb_transfer` as an opaque handle between
//! `libusb_submit_transfer` and the completion callback.

use crate::error::Result;

/// One USB endpoint's direction and number, independent of which
/// character device it backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointAddress {
    pub number: u8,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Bulk,
    Interrupt,
}

/// Library-assigned handle to a single in-flight transfer. Opaque to the
/// engine beyond equality and the ability to hand it back for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(u64);

impl TransferHandle {
    pub fn from_raw(raw: u64) -> Self {
        TransferHandle(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Outcome of a completed transfer, collapsing the USB library's full
/// status enum down to the three cases the engine cares about (spec.md
/// §4.3): a clean completion, a cancellation the engine itself requested,
/// or anything else, which is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Cancelled,
    Error,
}

/// A completed transfer, delivered from the event loop's USB-fd callback
/// back into the owning endpoint.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub handle: TransferHandle,
    pub status: TransferStatus,
    /// Bytes actually transferred. For OUT transfers, a short completion
    /// (`actual_length < requested length`) with `Completed` status is a
    /// fatal condition per spec.md §4.3.
    pub actual_length: usize,
    pub requested_length: usize,
}

/// Submission and cancellation surface the endpoint engine needs from a
/// USB access library. Implemented by [`crate::usb_backend::RusbTransport`]
/// for real devices and by an in-memory fake for unit tests.
pub trait UsbTransport {
    /// Submit `td_buf[..len]` (OUT) or `td_buf` as a write target (IN) for
    /// a transfer of `kind` on `endpoint`. Returns the handle the
    /// eventual [`Completion`] will carry.
    fn submit(
        &mut self,
        endpoint: EndpointAddress,
        kind: TransferKind,
        buf: &mut [u8],
        len: usize,
    ) -> Result<TransferHandle>;

    /// Requests cancellation of a previously submitted transfer. A
    /// "not found" result (the transfer already completed) is folded
    /// into `Ok(())` by implementations, matching `cancel_all`'s
    /// treatment of `LIBUSB_ERROR_NOT_FOUND` as benign.
    fn cancel(&mut self, handle: TransferHandle) -> Result<()>;
}
