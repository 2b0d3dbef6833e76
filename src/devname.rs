//! Endpoint-to-character-device naming (spec.md §6): `usbpiper_{bulk|interrupt}_{in|out}_{NN}`.

use crate::usb_transport::{Direction, TransferKind};

pub fn endpoint_devname(kind: TransferKind, direction: Direction, number: u8) -> String {
    let kind = match kind {
        TransferKind::Bulk => "bulk",
        TransferKind::Interrupt => "interrupt",
    };
    let direction = match direction {
        Direction::In => "in",
        Direction::Out => "out",
    };
    format!("usbpiper_{}_{}_{:02}", kind, direction, number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bulk_in() {
        assert_eq!(
            endpoint_devname(TransferKind::Bulk, Direction::In, 1),
            "usbpiper_bulk_in_01"
        );
    }

    #[test]
    fn formats_interrupt_out() {
        assert_eq!(
            endpoint_devname(TransferKind::Interrupt, Direction::Out, 15),
            "usbpiper_interrupt_out_15"
        );
    }
}
