//! [`UsbTransport`] implementation on top of `rusb`'s async transfer API,
//! including the pollfd-notifier dance that keeps the event loop's epoll
//! set in sync with libusb's own descriptor set.
//!
//! Grounded directly in `usb.c`: `transfer_in_callback`/`transfer_out_callback`
//! become [`transfer_callback`]; `try_queue_bulkin`/`try_queue_bulkout`'s
//! `libusb_fill_*_transfer`/`libusb_submit_transfer` pair becomes
//! [`RusbTransport::submit`]; `cancel_all`'s `libusb_cancel_transfer` loop
//! becomes [`RusbTransport::cancel`]; `usb_epoll_callback` becomes
//! [`RusbTransport::process_events`]; `usb_epoll_add`/`usb_epoll_remove` and
//! `libusb_set_pollfd_notifiers` become [`RusbTransport::drain_fd_changes`],
//! fed by a libusb notifier pair that pushes into a shared queue instead of
//! calling back into epoll directly (Rust's `Context` is `Send` but not
//! re-entrant into our event loop from an arbitrary libusb thread).

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};

use crate::error::{Error, Result};
use crate::usb_transport::{
    Completion, Direction, EndpointAddress, TransferHandle, TransferKind, TransferStatus,
    UsbTransport,
};

/// A pollfd the event loop must add or remove, mirroring `usb_epoll_add`/
/// `usb_epoll_remove`'s arguments.
pub enum FdChange {
    Add(RawFd, nix::sys::epoll::EpollFlags),
    Remove(RawFd),
}

struct Shared {
    completions: Mutex<VecDeque<Completion>>,
    fd_changes: Mutex<VecDeque<FdChange>>,
}

pub struct RusbTransport {
    context: Context,
    handle: DeviceHandle<Context>,
    shared: Arc<Shared>,
    next_handle: u64,
    // Keeps every in-flight `libusb_transfer` alive until its callback runs.
    inflight: Vec<*mut rusb::ffi::libusb_transfer>,
}

// SAFETY: all libusb calls happen on the single event-loop thread; `Context`
// and `DeviceHandle` are only ever touched from there.
unsafe impl Send for RusbTransport {}

impl RusbTransport {
    pub fn new(context: Context, handle: DeviceHandle<Context>) -> Result<Self> {
        let shared = Arc::new(Shared {
            completions: Mutex::new(VecDeque::new()),
            fd_changes: Mutex::new(VecDeque::new()),
        });

        for pollfd in context.pollfds() {
            shared
                .fd_changes
                .lock()
                .unwrap()
                .push_back(FdChange::Add(pollfd.fd, to_epoll_flags(pollfd.events)));
        }

        let notify_shared = shared.clone();
        context.set_pollfd_notifiers(
            move |fd, events| {
                notify_shared
                    .fd_changes
                    .lock()
                    .unwrap()
                    .push_back(FdChange::Add(fd, to_epoll_flags(events)));
            },
            {
                let notify_shared = shared.clone();
                move |fd| {
                    notify_shared
                        .fd_changes
                        .lock()
                        .unwrap()
                        .push_back(FdChange::Remove(fd));
                }
            },
        );

        Ok(RusbTransport {
            context,
            handle,
            shared,
            next_handle: 1,
            inflight: Vec::new(),
        })
    }

    /// Drains pending pollfd add/remove notifications for the event loop to
    /// apply to its epoll set.
    pub fn drain_fd_changes(&mut self) -> Vec<FdChange> {
        self.shared.fd_changes.lock().unwrap().drain(..).collect()
    }

    /// Non-blocking libusb event processing, called when any libusb fd
    /// becomes readable. Matches `usb_epoll_callback`'s zero-timeout
    /// `libusb_handle_events_timeout`.
    pub fn process_events(&mut self) -> Result<()> {
        self.context
            .handle_events(Some(Duration::ZERO))
            .map_err(Error::Usb)?;
        self.reap_finished_transfers();
        Ok(())
    }

    fn reap_finished_transfers(&mut self) {
        // Transfers whose callback has already fired are freed here rather
        // than inside the callback itself, since `libusb_free_transfer`
        // from within the callback is documented as unsafe for some
        // backends.
        self.inflight.retain(|&ptr| {
            let done = unsafe { (*ptr).user_data.is_null() };
            if done {
                unsafe { rusb::ffi::libusb_free_transfer(ptr) };
            }
            !done
        });
    }

    /// Drains completions queued by [`transfer_callback`] since the last call.
    pub fn poll_completions(&mut self) -> Vec<Completion> {
        self.shared.completions.lock().unwrap().drain(..).collect()
    }
}

fn to_epoll_flags(events: i16) -> nix::sys::epoll::EpollFlags {
    use nix::sys::epoll::EpollFlags;
    let mut flags = EpollFlags::empty();
    if events & (libc::POLLIN as i16) != 0 {
        flags |= EpollFlags::EPOLLIN;
    }
    if events & (libc::POLLOUT as i16) != 0 {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

/// Boxed alongside each `libusb_transfer` as its `user_data`, so the
/// extern "C" callback can report the completion without any global state.
struct TransferContext {
    handle: TransferHandle,
    shared: Arc<Shared>,
    requested_length: usize,
}

extern "C" fn transfer_callback(transfer: *mut rusb::ffi::libusb_transfer) {
    unsafe {
        let ctx_ptr = (*transfer).user_data as *mut TransferContext;
        (*transfer).user_data = std::ptr::null_mut();
        let ctx = Box::from_raw(ctx_ptr);

        let status = match (*transfer).status {
            rusb::ffi::constants::LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
            rusb::ffi::constants::LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
            _ => TransferStatus::Error,
        };

        let completion = Completion {
            handle: ctx.handle,
            status,
            actual_length: (*transfer).actual_length as usize,
            requested_length: ctx.requested_length,
        };

        ctx.shared.completions.lock().unwrap().push_back(completion);
        // `ctx` (boxed) is intentionally dropped here; the transfer struct
        // itself is freed later by `reap_finished_transfers`, once this
        // function has fully returned control to libusb.
    }
}

impl UsbTransport for RusbTransport {
    fn submit(
        &mut self,
        endpoint: EndpointAddress,
        kind: TransferKind,
        buf: &mut [u8],
        len: usize,
    ) -> Result<TransferHandle> {
        let ep_addr = match endpoint.direction {
            Direction::In => endpoint.number | 0x80,
            Direction::Out => endpoint.number,
        };

        let handle = TransferHandle::from_raw(self.next_handle);
        self.next_handle += 1;

        let transfer = unsafe { rusb::ffi::libusb_alloc_transfer(0) };
        if transfer.is_null() {
            return Err(Error::Fatal("libusb_alloc_transfer failed".into()));
        }

        let ctx = Box::new(TransferContext {
            handle,
            shared: self.shared.clone(),
            requested_length: len,
        });

        unsafe {
            let fill = match kind {
                TransferKind::Bulk => rusb::ffi::libusb_fill_bulk_transfer,
                TransferKind::Interrupt => rusb::ffi::libusb_fill_interrupt_transfer,
            };
            fill(
                transfer,
                self.handle.as_raw(),
                ep_addr,
                buf.as_mut_ptr(),
                len as i32,
                transfer_callback,
                Box::into_raw(ctx) as *mut libc::c_void,
                0,
            );

            let rc = rusb::ffi::libusb_submit_transfer(transfer);
            if rc < 0 {
                let ctx = Box::from_raw((*transfer).user_data as *mut TransferContext);
                drop(ctx);
                rusb::ffi::libusb_free_transfer(transfer);
                return Err(Error::Fatal(format!(
                    "libusb_submit_transfer on endpoint {} failed: {}",
                    endpoint.number, rc
                )));
            }
        }

        self.inflight.push(transfer);
        Ok(handle)
    }

    fn cancel(&mut self, handle: TransferHandle) -> Result<()> {
        for &transfer in &self.inflight {
            let matches = unsafe {
                let ptr = (*transfer).user_data as *const TransferContext;
                !ptr.is_null() && (*ptr).handle == handle
            };
            if matches {
                let rc = unsafe { rusb::ffi::libusb_cancel_transfer(transfer) };
                if rc < 0 && rc != rusb::ffi::constants::LIBUSB_ERROR_NOT_FOUND {
                    return Err(Error::Fatal(format!("libusb_cancel_transfer failed: {}", rc)));
                }
                return Ok(());
            }
        }
        // Already completed; the completion may already be queued.
        Ok(())
    }
}
