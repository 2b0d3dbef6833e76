//! Single-threaded epoll-driven reactor (spec.md §4.6).
//!
//! Three kinds of descriptors are registered, each tagged by a [`Token`]
//! carried in `epoll_event.data.u64` (a `slab`-indexed small integer,
//! unlike the original's `data.ptr` to a `{function, context}` pair — Rust
//! code shouldn't stash a raw pointer in a kernel-visible union when an
//! index into an owned table does the same job safely):
//!
//! - `Token::Cdus(idx)` — a file's `/dev/cuse` fd.
//! - `Token::Timer(idx)` — a file's timerfd.
//! - `Token::Usb` — any of libusb's internal fds; there is exactly one
//!   token for all of them, since the only thing to do on any of them is
//!   call into `process_events`, same as `usb_callback_info` being shared
//!   by every libusb pollfd in `usb.c`.

use std::os::unix::io::{AsRawFd, RawFd};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use slab::Slab;

use crate::cdus;
use crate::error::{Error, Result};
use crate::file_state::File;
use crate::usb_backend::{FdChange, RusbTransport};

#[derive(Debug, Clone, Copy)]
enum Token {
    Cdus(usize),
    Timer(usize),
    Usb,
}

pub struct EventLoop {
    epoll: Epoll,
    tokens: Slab<Token>,
    usb_token: Option<usize>,
    files: Vec<File>,
    request_buf: Vec<u8>,
    transport: RusbTransport,
}

impl EventLoop {
    pub fn new(files: Vec<File>, transport: RusbTransport, max_payload: usize) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(Error::Errno)?;
        let mut me = EventLoop {
            epoll,
            tokens: Slab::new(),
            usb_token: None,
            files,
            request_buf: vec![0u8; cdus::wire::max_request_bufsize(max_payload)],
            transport,
        };

        for idx in 0..me.files.len() {
            me.register_file(idx)?;
        }
        me.apply_fd_changes()?;

        Ok(me)
    }

    fn register_file(&mut self, idx: usize) -> Result<()> {
        let cdus_token = self.tokens.insert(Token::Cdus(idx));
        let cdus_fd = self.files[idx].fd();
        self.epoll
            .add(
                BorrowedFdShim(cdus_fd),
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR, cdus_token as u64),
            )
            .map_err(Error::Errno)?;

        let timer_token = self.tokens.insert(Token::Timer(idx));
        let timer_fd = self.files[idx].timer().as_raw_fd();
        self.epoll
            .add(
                BorrowedFdShim(timer_fd),
                EpollEvent::new(EpollFlags::EPOLLIN, timer_token as u64),
            )
            .map_err(Error::Errno)?;

        Ok(())
    }

    fn usb_token(&mut self) -> u64 {
        if let Some(t) = self.usb_token {
            return t as u64;
        }
        let t = self.tokens.insert(Token::Usb);
        self.usb_token = Some(t);
        t as u64
    }

    fn apply_fd_changes(&mut self) -> Result<()> {
        let token = self.usb_token();
        for change in self.transport.drain_fd_changes() {
            match change {
                FdChange::Add(fd, flags) => {
                    self.epoll
                        .add(BorrowedFdShim(fd), EpollEvent::new(flags, token))
                        .map_err(Error::Errno)?;
                }
                FdChange::Remove(fd) => {
                    let _ = self.epoll.delete(BorrowedFdShim(fd));
                }
            }
        }
        Ok(())
    }

    /// Runs until a callback reports a fatal error. Never returns `Ok` —
    /// the original has no notion of a clean shutdown either; only a
    /// signal or fatal error ends the process.
    pub fn run(&mut self) -> Result<()> {
        let mut events = [EpollEvent::empty(); 64];
        loop {
            let n = self
                .epoll
                .wait(&mut events, EpollTimeout::NONE)
                .map_err(Error::Errno)?;

            for ev in &events[..n] {
                let token = *self
                    .tokens
                    .get(ev.data() as usize)
                    .expect("epoll delivered an event for an unknown token");
                self.dispatch(token)?;
            }

            self.apply_fd_changes()?;
        }
    }

    fn dispatch(&mut self, token: Token) -> Result<()> {
        match token {
            Token::Cdus(idx) => self.on_cdus_readable(idx),
            Token::Timer(idx) => self.files[idx].on_timer_fired(&mut self.transport),
            Token::Usb => self.on_usb_readable(),
        }
    }

    fn on_cdus_readable(&mut self, idx: usize) -> Result<()> {
        let fd = self.files[idx].fd();
        let request = match cdus::read_request(fd, &mut self.request_buf) {
            Ok(Some(req)) => req,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.files[idx].handle_request(request, &mut self.transport)
    }

    fn on_usb_readable(&mut self) -> Result<()> {
        self.transport.process_events()?;

        for completion in self.transport.poll_completions() {
            self.route_completion(completion)?;
        }
        Ok(())
    }

    fn route_completion(&mut self, completion: crate::usb_transport::Completion) -> Result<()> {
        for idx in 0..self.files.len() {
            let file = &mut self.files[idx];

            if let Some(source) = file.source.as_mut() {
                if let Some(id) = source.find_td(completion.handle) {
                    let deposited = source.complete_in(id, completion)?;
                    if deposited.is_some() && file.has_pending_read() {
                        file.try_complete_read(&mut self.transport)?;
                    }
                    // Only refill while the file is actually open for read —
                    // during RELEASING a TD that raced cancellation can still
                    // land `Completed`, and re-submitting here would re-arm
                    // traffic on an endpoint that's supposed to be draining
                    // closed, stalling `try_complete_release`'s queued-TD wait.
                    if file.is_open() {
                        file.source.as_mut().unwrap().try_queue_bulkin(&mut self.transport)?;
                    }
                    if file.is_releasing() {
                        file.try_complete_release(&mut self.transport)?;
                    }
                    return Ok(());
                }
            }

            if let Some(sink) = file.sink.as_mut() {
                if let Some(id) = sink.find_td(completion.handle) {
                    sink.complete_out(id, completion)?;
                    let submitted = file.sink.as_mut().unwrap().try_queue_bulkout(&mut self.transport)?;
                    if submitted {
                        file.try_complete_write()?;
                    }
                    if file.is_releasing() {
                        file.try_complete_release(&mut self.transport)?;
                    }
                    return Ok(());
                }
            }
        }

        log::warn!("completion for unknown transfer handle {:?}", completion.handle);
        Ok(())
    }
}

/// `nix`'s `Epoll` API takes `impl AsFd`; raw fds collected from files we
/// don't own a `BorrowedFd` for (the USB library's, and files' own) are
/// wrapped here rather than threading lifetimes through `Slab`/`Vec`.
struct BorrowedFdShim(RawFd);

impl std::os::fd::AsFd for BorrowedFdShim {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        unsafe { std::os::fd::BorrowedFd::borrow_raw(self.0) }
    }
}
