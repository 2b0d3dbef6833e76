//! CUSE/FUSE kernel ABI structs and opcodes.
//!
//! Layouts come from `examples/original_source/cuse.h`. Only the fields
//! this daemon actually reads or writes are given named structs; the rest
//! of the kernel's `fuse_opcode` enum is left as bare numbers, since every
//! opcode but the ones below is refused with `ENOSYS` (spec.md §4.4).
//!
//! Modeled on `fuser`'s `fuse_abi.rs`: plain `#[repr(C)]` structs, public
//! fields, little-endian-native (the kernel ABI is host-endian, not
//! wire-endian, since CUSE only exists on the local machine).

pub const CUSE_INIT: u32 = 4096;
pub const FUSE_OPEN: u32 = 14;
pub const FUSE_READ: u32 = 15;
pub const FUSE_WRITE: u32 = 16;
pub const FUSE_RELEASE: u32 = 18;
pub const FUSE_INTERRUPT: u32 = 36;
pub const FUSE_IOCTL: u32 = 39;

pub const FOPEN_DIRECT_IO: u32 = 1 << 0;
pub const FOPEN_NONSEEKABLE: u32 = 1 << 2;

pub const CUSE_DEV_MAJOR: u32 = 456;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

pub const IN_HEADER_SIZE: usize = std::mem::size_of::<InHeader>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct OutHeader {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

pub const OUT_HEADER_SIZE: usize = std::mem::size_of::<OutHeader>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CuseInitIn {
    pub major: u32,
    pub minor: u32,
    pub unused: u32,
    pub flags: u32,
}

pub const CUSE_INIT_IN_SIZE: usize = std::mem::size_of::<CuseInitIn>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CuseInitOut {
    pub major: u32,
    pub minor: u32,
    pub unused: u32,
    pub flags: u32,
    pub max_read: u32,
    pub max_write: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub spare: [u32; 10],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenIn {
    pub flags: u32,
    pub unused: u32,
}

pub const OPEN_IN_SIZE: usize = std::mem::size_of::<OpenIn>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOut {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub read_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

pub const READ_IN_SIZE: usize = std::mem::size_of::<ReadIn>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub write_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

pub const WRITE_IN_SIZE: usize = std::mem::size_of::<WriteIn>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOut {
    pub size: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptIn {
    pub unique: u64,
}

pub const INTERRUPT_IN_SIZE: usize = std::mem::size_of::<InterruptIn>();

/// Largest request header + body this daemon needs to read in one shot:
/// a WRITE carrying up to `max_payload` bytes of data.
pub fn max_request_bufsize(max_payload: usize) -> usize {
    let max_in = IN_HEADER_SIZE + WRITE_IN_SIZE;
    let max_out = OUT_HEADER_SIZE + std::mem::size_of::<WriteOut>();
    max_payload + max_in.max(max_out)
}

/// # Safety
/// `T` must be a `#[repr(C)]` struct of plain integers (no padding bytes
/// read as uninitialized, no pointers) — true of every struct in this module.
pub unsafe fn read_struct<T: Copy>(buf: &[u8]) -> Option<T> {
    if buf.len() < std::mem::size_of::<T>() {
        return None;
    }
    Some(std::ptr::read_unaligned(buf.as_ptr() as *const T))
}

/// # Safety
/// See [`read_struct`].
pub unsafe fn struct_as_bytes<T: Copy>(val: &T) -> &[u8] {
    std::slice::from_raw_parts((val as *const T) as *const u8, std::mem::size_of::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_header_round_trips() {
        let h = InHeader {
            len: 40,
            opcode: FUSE_WRITE,
            unique: 7,
            nodeid: 1,
            uid: 1000,
            gid: 1000,
            pid: 4242,
            padding: 0,
        };
        let bytes = unsafe { struct_as_bytes(&h) };
        assert_eq!(bytes.len(), IN_HEADER_SIZE);
        let back: InHeader = unsafe { read_struct(bytes).unwrap() };
        assert_eq!(back.len, h.len);
        assert_eq!(back.opcode, h.opcode);
        assert_eq!(back.unique, h.unique);
        assert_eq!(back.nodeid, h.nodeid);
        assert_eq!(back.pid, h.pid);
    }

    #[test]
    fn out_header_round_trips() {
        let h = OutHeader {
            len: 16,
            error: -5,
            unique: 99,
        };
        let bytes = unsafe { struct_as_bytes(&h) };
        let back: OutHeader = unsafe { read_struct(bytes).unwrap() };
        assert_eq!(back.len, h.len);
        assert_eq!(back.error, h.error);
        assert_eq!(back.unique, h.unique);
    }

    #[test]
    fn read_struct_rejects_short_buffer() {
        let bytes = [0u8; 4];
        let parsed: Option<InHeader> = unsafe { read_struct(&bytes) };
        assert!(parsed.is_none());
    }
}
