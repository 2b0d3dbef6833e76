//! Per-character-device state machine: mediates between CDUS requests and
//! the FIFO/TD traffic of the endpoint(s) bound to this file.
//!
//! Grounded in `devfile.c`'s `piperusbfile` plus its `complete_*`/`process_*`/
//! `try_complete_*` functions; state is now an explicit enum instead of the
//! C `enum xusb_state`, and there's no shared static request buffer — each
//! `File` owns its own.

use std::os::unix::io::RawFd;

use crate::cdus::wire::{
    self, CuseInitIn, CuseInitOut, InterruptIn, OpenIn, OpenOut, ReadIn, WriteIn, WriteOut,
    CUSE_DEV_MAJOR, CUSE_INIT, FOPEN_DIRECT_IO, FOPEN_NONSEEKABLE, FUSE_INTERRUPT, FUSE_IOCTL,
    FUSE_OPEN, FUSE_READ, FUSE_RELEASE, FUSE_WRITE, WRITE_IN_SIZE,
};
use crate::cdus::{self, Errno, Request};
use crate::endpoint::{Endpoint, MAX_PAYLOAD};
use crate::error::{Error, Result};
use crate::timer::{Timer, PARTIAL_READ_DELAY, RELEASE_DRAIN_DELAY};
use crate::usb_transport::UsbTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    Releasing,
}

pub struct File {
    pub name: String,
    fd: RawFd,
    timer: Timer,
    state: State,
    unique_up: u64,
    unique_down: u64,
    read_size: u32,
    write_size: u32,
    timer_armed: bool,
    timed_out: bool,
    interrupted_up: bool,
    interrupted_down: bool,
    bulkout_canceled: bool,
    pub source: Option<Endpoint>,
    pub sink: Option<Endpoint>,
}

impl File {
    pub fn new(name: String, fd: RawFd, source: Option<Endpoint>, sink: Option<Endpoint>) -> Result<Self> {
        Ok(File {
            name,
            fd,
            timer: Timer::new()?,
            state: State::Closed,
            unique_up: 0,
            unique_down: 0,
            read_size: 0,
            write_size: 0,
            timer_armed: false,
            timed_out: false,
            interrupted_up: false,
            interrupted_down: false,
            bulkout_canceled: false,
            source,
            sink,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn is_releasing(&self) -> bool {
        self.state == State::Releasing
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    pub fn has_pending_read(&self) -> bool {
        self.unique_up != 0
    }

    fn arm_timer(&mut self, delay: std::time::Duration) -> Result<()> {
        self.timer.arm(delay)?;
        self.timer_armed = true;
        Ok(())
    }

    fn disarm_timer(&mut self) -> Result<()> {
        if self.timer_armed {
            self.timer.disarm()?;
            self.timer_armed = false;
        }
        Ok(())
    }

    pub fn handle_request(&mut self, req: Request, transport: &mut dyn UsbTransport) -> Result<()> {
        match req.header.opcode {
            CUSE_INIT => self.complete_init(&req),
            FUSE_OPEN => self.complete_open(&req, transport),
            FUSE_READ => self.process_read(&req, transport),
            FUSE_WRITE => self.process_write(&req, transport),
            FUSE_RELEASE => self.process_release(&req, transport),
            FUSE_INTERRUPT => self.process_interrupt(&req, transport),
            FUSE_IOCTL => cdus::send_status(self.fd, req.header.unique, Errno::EINVAL),
            other => {
                log::info!("{}: unsupported opcode {}", self.name, other);
                cdus::send_status(self.fd, req.header.unique, Errno::ENOSYS)
            }
        }
    }

    fn complete_init(&mut self, req: &Request) -> Result<()> {
        let init_in: CuseInitIn = unsafe { wire::read_struct(&req.body) }
            .ok_or(Error::Protocol("truncated CUSE_INIT body"))?;

        if init_in.major != 7 || init_in.minor < 21 {
            return Err(Error::Fatal(format!(
                "FUSE revision {}.{} inadequate: 7.21 and later is required",
                init_in.major, init_in.minor
            )));
        }

        let assignment = format!("DEVNAME={}", self.name);
        if assignment.len() > 63 {
            return Err(Error::Fatal(format!("device name {} too long", self.name)));
        }

        let reply = CuseInitOut {
            major: 7,
            minor: 21,
            unused: 0,
            flags: 0,
            max_read: MAX_PAYLOAD as u32,
            max_write: MAX_PAYLOAD as u32,
            dev_major: CUSE_DEV_MAJOR,
            dev_minor: self.fd as u32,
            spare: [0; 10],
        };

        let mut body = unsafe { wire::struct_as_bytes(&reply) }.to_vec();
        body.extend_from_slice(assignment.as_bytes());
        body.push(0);

        cdus::send_reply(self.fd, req.header.unique, &body)
    }

    fn complete_open(&mut self, req: &Request, transport: &mut dyn UsbTransport) -> Result<()> {
        let open_in: OpenIn =
            unsafe { wire::read_struct(&req.body) }.ok_or(Error::Protocol("truncated OPEN body"))?;

        log::debug!("OPEN {} flags = {:#x}", self.name, open_in.flags);

        if self.state != State::Closed {
            log::warn!("rejected attempt to double-open {}", self.name);
            return cdus::send_status(self.fd, req.header.unique, Errno::EBUSY);
        }

        // O_RDONLY == 0, O_WRONLY == 1, O_RDWR == 2.
        let open_for_read = (open_in.flags & libc::O_WRONLY as u32) == 0;
        let open_for_write = (open_in.flags & (libc::O_WRONLY | libc::O_RDWR) as u32) != 0;

        if (open_for_read && self.source.is_none()) || (open_for_write && self.sink.is_none()) {
            return cdus::send_status(self.fd, req.header.unique, Errno::ENODEV);
        }

        if open_for_read {
            self.source.as_mut().unwrap().try_queue_bulkin(transport)?;
        }

        self.state = State::Open;

        let reply = OpenOut {
            fh: 0,
            open_flags: FOPEN_DIRECT_IO | FOPEN_NONSEEKABLE,
            padding: 0,
        };
        let body = unsafe { wire::struct_as_bytes(&reply) };
        cdus::send_reply(self.fd, req.header.unique, body)
    }

    fn process_read(&mut self, req: &Request, transport: &mut dyn UsbTransport) -> Result<()> {
        let read_in: ReadIn =
            unsafe { wire::read_struct(&req.body) }.ok_or(Error::Protocol("truncated READ body"))?;

        if self.source.is_none() {
            return Err(Error::Fatal(format!(
                "READ request to {}, which isn't readable",
                self.name
            )));
        }
        if self.unique_up != 0 {
            return cdus::send_status(self.fd, req.header.unique, Errno::EINVAL);
        }
        if self.timer_armed {
            log::warn!("{} received a READ request with the timer armed", self.name);
            self.disarm_timer()?;
        }

        self.unique_up = req.header.unique;
        self.read_size = read_in.size;
        self.timed_out = false;
        self.interrupted_up = false;

        self.try_complete_read(transport)
    }

    pub fn try_complete_read(&mut self, transport: &mut dyn UsbTransport) -> Result<()> {
        let count = self.source.as_ref().unwrap().fifo.fill() as u32;

        if self.interrupted_up && count == 0 {
            cdus::send_status(self.fd, self.unique_up, Errno::EINTR)?;
            self.unique_up = 0;
            return Ok(());
        }

        if count == 0 || (count < self.read_size && !self.timed_out && !self.interrupted_up) {
            if !self.timer_armed && !self.timed_out {
                self.arm_timer(PARTIAL_READ_DELAY)?;
            }
            return Ok(());
        }

        self.disarm_timer()?;

        let count = count.min(self.read_size) as usize;
        let mut payload = vec![0u8; count];
        let source = self.source.as_mut().unwrap();
        let delivered = source.fifo.read(&mut payload);
        if delivered != count {
            return Err(Error::Fatal(format!("fifo read() accounting bug on {}", self.name)));
        }

        let unique = self.unique_up;
        self.unique_up = 0;
        cdus::send_reply(self.fd, unique, &payload)?;

        // Draining the FIFO may have freed enough room to admit another TD.
        self.source.as_mut().unwrap().try_queue_bulkin(transport)?;
        Ok(())
    }

    fn process_write(&mut self, req: &Request, transport: &mut dyn UsbTransport) -> Result<()> {
        let write_in: WriteIn =
            unsafe { wire::read_struct(&req.body) }.ok_or(Error::Protocol("truncated WRITE body"))?;

        if self.sink.is_none() {
            return Err(Error::Fatal(format!(
                "WRITE request to {}, which isn't writable",
                self.name
            )));
        }
        if self.unique_down != 0 {
            return cdus::send_status(self.fd, req.header.unique, Errno::EINVAL);
        }

        let payload = &req.body[WRITE_IN_SIZE..];
        let sink = self.sink.as_mut().unwrap();
        let accepted = sink.fifo.write(payload);
        if accepted != write_in.size as usize {
            return Err(Error::Fatal(format!(
                "fifo for {} was unable to accept {} bytes (only {})",
                self.name, write_in.size, accepted
            )));
        }

        self.unique_down = req.header.unique;
        self.write_size = write_in.size;
        self.interrupted_down = false;

        sink.try_queue_bulkout(transport)?;
        self.try_complete_write()
    }

    pub fn try_complete_write(&mut self) -> Result<()> {
        if self.unique_down == 0 {
            return Ok(());
        }
        let sink = self.sink.as_mut().unwrap();

        if !self.interrupted_down && sink.fifo.vacant() < MAX_PAYLOAD {
            return Ok(());
        }

        let mut count = self.write_size;
        if self.interrupted_down {
            let target = sink.fifo.capacity() - MAX_PAYLOAD;
            let dropped = sink.fifo.limit(target) as u32;
            count = count.saturating_sub(dropped);
        }

        if count == 0 && self.write_size != 0 {
            cdus::send_status(self.fd, self.unique_down, Errno::EINTR)?;
            self.unique_down = 0;
            return Ok(());
        }

        let reply = WriteOut { size: count, padding: 0 };
        let body = unsafe { wire::struct_as_bytes(&reply) };
        let unique = self.unique_down;
        self.unique_down = 0;
        cdus::send_reply(self.fd, unique, body)
    }

    fn process_release(&mut self, req: &Request, transport: &mut dyn UsbTransport) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::Fatal(format!(
                "{} is not open, and yet it got a RELEASE request",
                self.name
            )));
        }
        if self.unique_down != 0 || self.unique_up != 0 {
            log::warn!(
                "{} received a RELEASE request, but there's still outstanding I/O",
                self.name
            );
            return cdus::send_status(self.fd, req.header.unique, Errno::EBADF);
        }
        if self.timer_armed {
            log::warn!("{} received a RELEASE request, with the timer armed", self.name);
            self.disarm_timer()?;
        }

        self.unique_down = req.header.unique;
        self.state = State::Releasing;
        self.timed_out = false;
        self.interrupted_down = false;
        self.bulkout_canceled = false;

        if let Some(source) = self.source.as_mut() {
            source.cancel_all(transport)?;
        }

        self.try_complete_release(transport)
    }

    pub fn try_complete_release(&mut self, transport: &mut dyn UsbTransport) -> Result<()> {
        let sink_fill = self.sink.as_ref().map(|s| s.fifo.fill()).unwrap_or(0);

        let mut ok_to_release = true;
        if let Some(source) = &self.source {
            if source.has_queued() {
                ok_to_release = false;
            }
        }
        if let Some(sink) = &self.sink {
            if sink.has_queued() {
                ok_to_release = false;
            }
        }
        if sink_fill != 0 && !self.timed_out && !self.interrupted_down {
            ok_to_release = false;
        }

        if ok_to_release {
            self.disarm_timer()?;

            if sink_fill != 0 && self.timed_out {
                log::warn!(
                    "timed out while flushing, lost at least {} bytes of data on {}",
                    sink_fill,
                    self.name
                );
            }

            if let Some(sink) = self.sink.as_mut() {
                sink.fifo.limit(0);
            }
            if let Some(source) = self.source.as_mut() {
                source.fifo.limit(0);
            }

            self.state = State::Closed;
            let unique = self.unique_down;
            self.unique_down = 0;
            return cdus::send_status(
                self.fd,
                unique,
                if self.interrupted_down { Errno::EINTR } else { Errno::OK },
            );
        }

        if self.timed_out && !self.bulkout_canceled {
            if let Some(sink) = self.sink.as_mut() {
                self.bulkout_canceled = true;
                sink.fifo.limit(0);
                sink.cancel_all(transport)?;
            }
        }

        if !self.timer_armed {
            self.arm_timer(RELEASE_DRAIN_DELAY)?;
        }

        Ok(())
    }

    fn process_interrupt(&mut self, req: &Request, transport: &mut dyn UsbTransport) -> Result<()> {
        let interrupt_in: InterruptIn =
            unsafe { wire::read_struct(&req.body) }.ok_or(Error::Protocol("truncated INTERRUPT body"))?;

        if interrupt_in.unique == self.unique_down {
            self.interrupted_down = true;
            return if self.state == State::Open {
                self.try_complete_write()
            } else {
                self.try_complete_release(transport)
            };
        }

        if interrupt_in.unique == self.unique_up {
            self.interrupted_up = true;
            return self.try_complete_read(transport);
        }

        // A harmless race: the request this interrupts already completed.
        Ok(())
    }

    /// Called from the event loop when this file's timer fd delivers a tick.
    pub fn on_timer_fired(&mut self, transport: &mut dyn UsbTransport) -> Result<()> {
        let ticks = self.timer.read_ticks()?;
        if ticks.is_none() {
            return Ok(());
        }

        self.timer_armed = false;
        self.timed_out = true;

        if self.state == State::Open && self.unique_up != 0 {
            self.try_complete_read(transport)
        } else if self.state == State::Releasing && self.unique_down != 0 {
            self.try_complete_release(transport)
        } else {
            log::warn!("unexpected timer event for {}", self.name);
            Ok(())
        }
    }
}
