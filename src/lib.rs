//! Bridges a USB device's bulk and interrupt endpoints to character
//! devices exposed to user-space, by speaking the kernel's
//! character-device-in-user-space protocol (CDUS, i.e. CUSE) on one side
//! and driving asynchronous USB transfers on the other.
//!
//! The engine (`fifo`, `td`, `endpoint`, `cdus`, `file_state`, `event_loop`)
//! has no dependency on a specific USB access library — it talks through
//! the [`usb_transport::UsbTransport`] trait, letting [`endpoint`] and
//! [`file_state`] be unit-tested against an in-memory fake. The binary
//! (`src/main.rs`) wires the engine to [`usb_backend::RusbTransport`], a
//! real implementation built on `rusb`.

pub mod cdus;
pub mod config;
pub mod devname;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod event_loop;
pub mod fifo;
pub mod file_state;
pub mod td;
pub mod timer;
pub mod usb_backend;
pub mod usb_transport;
