//! Drives `usbpiper::file_state::File` through CDUS requests over a real
//! socketpair standing in for `/dev/cuse`, against an in-memory fake
//! transport standing in for libusb. No real USB device or kernel CUSE
//! support is available in a test environment, so both collaborators on
//! either side of the engine are faked; only the engine itself is real.

use std::os::unix::io::IntoRawFd;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::read;

use usbpiper::cdus::wire::{self, CuseInitIn, OpenIn, ReadIn, WriteIn, FUSE_OPEN, FUSE_READ, FUSE_WRITE};
use usbpiper::cdus::Request;
use usbpiper::endpoint::Endpoint;
use usbpiper::error::Result;
use usbpiper::file_state::File;
use usbpiper::usb_transport::{
    Completion, Direction, EndpointAddress, TransferHandle, TransferKind, TransferStatus, UsbTransport,
};

struct FakeTransport {
    next_handle: u64,
}

impl FakeTransport {
    fn new() -> Self {
        FakeTransport { next_handle: 1 }
    }
}

impl UsbTransport for FakeTransport {
    fn submit(
        &mut self,
        _endpoint: EndpointAddress,
        _kind: TransferKind,
        _buf: &mut [u8],
        _len: usize,
    ) -> Result<TransferHandle> {
        let h = self.next_handle;
        self.next_handle += 1;
        Ok(TransferHandle::from_raw(h))
    }

    fn cancel(&mut self, _handle: TransferHandle) -> Result<()> {
        Ok(())
    }
}

// Both ends intentionally leak for the test's duration: `File` takes
// ownership of the server end as a bare `RawFd` and never closes it itself
// (closing CDUS fds on shutdown is the daemon's job, out of scope for the
// engine under test here), and the client end just needs to outlive the
// handful of reads each test does on it.
fn make_pair() -> (std::os::unix::io::RawFd, std::os::unix::io::RawFd) {
    let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).unwrap();
    (a.into_raw_fd(), b.into_raw_fd())
}

fn build_request(opcode: u32, unique: u64, body: &[u8]) -> Request {
    let header = wire::InHeader {
        len: (wire::IN_HEADER_SIZE + body.len()) as u32,
        opcode,
        unique,
        nodeid: 1,
        uid: 1000,
        gid: 1000,
        pid: 4242,
        padding: 0,
    };
    Request {
        header,
        body: body.to_vec(),
    }
}

fn read_reply(fd: std::os::unix::io::RawFd) -> (wire::OutHeader, Vec<u8>) {
    let mut buf = [0u8; 4096];
    let n = read(fd, &mut buf).unwrap();
    let header: wire::OutHeader = unsafe { wire::read_struct(&buf[..n]) }.unwrap();
    let body = buf[wire::OUT_HEADER_SIZE..n].to_vec();
    (header, body)
}

#[test]
fn init_handshake_advertises_protocol_and_devname() {
    let (srv, cli) = make_pair();
    let mut transport = FakeTransport::new();
    let mut file = File::new("usbpiper_bulk_in_01".into(), srv, None, None).unwrap();

    let init_in = CuseInitIn {
        major: 7,
        minor: 21,
        unused: 0,
        flags: 0,
    };
    let body = unsafe { wire::struct_as_bytes(&init_in) };
    let req = build_request(wire::CUSE_INIT, 1, body);
    file.handle_request(req, &mut transport).unwrap();

    let (header, body) = read_reply(cli);
    assert_eq!(header.error, 0);
    assert_eq!(header.unique, 1);
    assert!(body.windows(8).any(|w| w == b"DEVNAME="));
    assert!(body.ends_with(b"usbpiper_bulk_in_01\0"));
}

#[test]
fn open_for_read_on_write_only_endpoint_is_enodev() {
    let (srv, cli) = make_pair();
    let mut transport = FakeTransport::new();
    let sink = Endpoint::new(
        EndpointAddress {
            number: 2,
            direction: Direction::Out,
        },
        TransferKind::Bulk,
    );
    let mut file = File::new("usbpiper_bulk_out_02".into(), srv, None, Some(sink)).unwrap();

    let open_in = OpenIn { flags: 0, unused: 0 }; // O_RDONLY
    let body = unsafe { wire::struct_as_bytes(&open_in) };
    let req = build_request(FUSE_OPEN, 2, body);
    file.handle_request(req, &mut transport).unwrap();

    let (header, _) = read_reply(cli);
    assert_eq!(header.error, -libc::ENODEV);
}

#[test]
fn second_open_is_rejected_with_ebusy() {
    let (srv, cli) = make_pair();
    let mut transport = FakeTransport::new();
    let source = Endpoint::new(
        EndpointAddress {
            number: 1,
            direction: Direction::In,
        },
        TransferKind::Bulk,
    );
    let mut file = File::new("usbpiper_bulk_in_01".into(), srv, Some(source), None).unwrap();

    let open_in = OpenIn { flags: 0, unused: 0 };
    let body = unsafe { wire::struct_as_bytes(&open_in) };

    file.handle_request(build_request(FUSE_OPEN, 1, body), &mut transport)
        .unwrap();
    let (first, _) = read_reply(cli);
    assert_eq!(first.error, 0);

    file.handle_request(build_request(FUSE_OPEN, 2, body), &mut transport)
        .unwrap();
    let (second, _) = read_reply(cli);
    assert_eq!(second.error, -libc::EBUSY);
}

#[test]
fn read_with_data_already_in_fifo_completes_immediately() {
    let (srv, cli) = make_pair();
    let mut transport = FakeTransport::new();
    let mut source = Endpoint::new(
        EndpointAddress {
            number: 1,
            direction: Direction::In,
        },
        TransferKind::Bulk,
    );
    source.fifo.write(b"hello, usb");
    let mut file = File::new("usbpiper_bulk_in_01".into(), srv, Some(source), None).unwrap();

    let open_in = OpenIn { flags: 0, unused: 0 };
    let open_body = unsafe { wire::struct_as_bytes(&open_in) };
    file.handle_request(build_request(FUSE_OPEN, 1, open_body), &mut transport)
        .unwrap();
    let _ = read_reply(cli);

    let read_in = ReadIn {
        fh: 0,
        offset: 0,
        size: 10,
        read_flags: 0,
        lock_owner: 0,
        flags: 0,
        padding: 0,
    };
    let body = unsafe { wire::struct_as_bytes(&read_in) };
    file.handle_request(build_request(FUSE_READ, 2, body), &mut transport)
        .unwrap();

    let (header, body) = read_reply(cli);
    assert_eq!(header.error, 0);
    assert_eq!(&body, b"hello, usb");
}

#[test]
fn write_completes_once_fifo_has_room_for_next_max_payload() {
    let (srv, cli) = make_pair();
    let mut transport = FakeTransport::new();
    let sink = Endpoint::new(
        EndpointAddress {
            number: 2,
            direction: Direction::Out,
        },
        TransferKind::Bulk,
    );
    let mut file = File::new("usbpiper_bulk_out_02".into(), srv, None, Some(sink)).unwrap();

    let open_in = OpenIn {
        flags: libc::O_WRONLY as u32,
        unused: 0,
    };
    let open_body = unsafe { wire::struct_as_bytes(&open_in) };
    file.handle_request(build_request(FUSE_OPEN, 1, open_body), &mut transport)
        .unwrap();
    let _ = read_reply(cli);

    let payload = vec![7u8; 1024];
    let write_in = WriteIn {
        fh: 0,
        offset: 0,
        size: payload.len() as u32,
        write_flags: 0,
        lock_owner: 0,
        flags: 0,
        padding: 0,
    };
    let mut body = unsafe { wire::struct_as_bytes(&write_in) }.to_vec();
    body.extend_from_slice(&payload);
    file.handle_request(build_request(FUSE_WRITE, 3, &body), &mut transport)
        .unwrap();

    let (header, reply_body) = read_reply(cli);
    assert_eq!(header.error, 0);
    let write_out: wire::WriteOut = unsafe { wire::read_struct(&reply_body) }.unwrap();
    assert_eq!(write_out.size, payload.len() as u32);
}

#[test]
fn interrupted_read_on_empty_fifo_returns_eintr() {
    let (srv, cli) = make_pair();
    let mut transport = FakeTransport::new();
    let source = Endpoint::new(
        EndpointAddress {
            number: 1,
            direction: Direction::In,
        },
        TransferKind::Bulk,
    );
    let mut file = File::new("usbpiper_bulk_in_01".into(), srv, Some(source), None).unwrap();

    let open_in = OpenIn { flags: 0, unused: 0 };
    let open_body = unsafe { wire::struct_as_bytes(&open_in) };
    file.handle_request(build_request(FUSE_OPEN, 1, open_body), &mut transport)
        .unwrap();
    let _ = read_reply(cli);

    let read_in = ReadIn {
        fh: 0,
        offset: 0,
        size: 10,
        read_flags: 0,
        lock_owner: 0,
        flags: 0,
        padding: 0,
    };
    let body = unsafe { wire::struct_as_bytes(&read_in) };
    file.handle_request(build_request(FUSE_READ, 2, body), &mut transport)
        .unwrap();
    // No data and no timeout yet: the timer is armed, no reply sent.

    let interrupt_in = wire::InterruptIn { unique: 2 };
    let body = unsafe { wire::struct_as_bytes(&interrupt_in) };
    file.handle_request(build_request(wire::FUSE_INTERRUPT, 3, body), &mut transport)
        .unwrap();

    let (header, _) = read_reply(cli);
    assert_eq!(header.error, -libc::EINTR);
}

#[test]
fn completion_deposits_into_fifo_and_unblocks_pending_read() {
    let source = Endpoint::new(
        EndpointAddress {
            number: 1,
            direction: Direction::In,
        },
        TransferKind::Bulk,
    );
    let (srv, cli) = make_pair();
    let mut transport = FakeTransport::new();
    let mut file = File::new("usbpiper_bulk_in_01".into(), srv, Some(source), None).unwrap();

    let open_in = OpenIn { flags: 0, unused: 0 };
    let open_body = unsafe { wire::struct_as_bytes(&open_in) };
    file.handle_request(build_request(FUSE_OPEN, 1, open_body), &mut transport)
        .unwrap();
    let _ = read_reply(cli);

    let read_in = ReadIn {
        fh: 0,
        offset: 0,
        size: 5,
        read_flags: 0,
        lock_owner: 0,
        flags: 0,
        padding: 0,
    };
    let body = unsafe { wire::struct_as_bytes(&read_in) };
    file.handle_request(build_request(FUSE_READ, 2, body), &mut transport)
        .unwrap();

    let handle = TransferHandle::from_raw(1); // first TD submitted during OPEN's try_queue_bulkin
    let id = file.source.as_ref().unwrap().find_td(handle).unwrap();
    let completion = Completion {
        handle,
        status: TransferStatus::Completed,
        actual_length: 5,
        requested_length: usbpiper::td::TD_SIZE,
    };
    file.source.as_mut().unwrap().complete_in(id, completion).unwrap();
    // `complete_in` alone doesn't drive the read forward; the event loop
    // would call `try_complete_read` next, as it does here.
    file.try_complete_read(&mut transport).unwrap();

    let (header, body) = read_reply(cli);
    assert_eq!(header.error, 0);
    assert_eq!(body.len(), 5);
}
