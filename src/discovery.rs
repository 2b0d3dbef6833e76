//! USB device discovery, interface claiming and endpoint enumeration —
//! out of scope for the core engine (spec.md §1), but needed to produce a
//! runnable binary. Grounded in `find_device`/`setup_device`/`setup_streams`
//! in `usb.c`, rebuilt on `rusb` instead of raw libusb calls.

use rusb::{Context, Direction as RusbDirection, TransferType, UsbContext};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::usb_transport::{Direction, EndpointAddress, TransferKind};

pub struct DiscoveredEndpoint {
    pub address: EndpointAddress,
    pub kind: TransferKind,
}

pub struct DiscoveredDevice {
    pub context: Context,
    pub handle: rusb::DeviceHandle<Context>,
    pub endpoints: Vec<DiscoveredEndpoint>,
}

pub fn discover(config: &Config) -> Result<DiscoveredDevice> {
    let context = Context::new().map_err(Error::Usb)?;

    let device = context
        .devices()
        .map_err(Error::Usb)?
        .iter()
        .find(|d| {
            d.device_descriptor()
                .map(|desc| desc.vendor_id() == config.vendor && desc.product_id() == config.product)
                .unwrap_or(false)
        })
        .ok_or_else(|| {
            Error::Fatal(format!(
                "failed to find USB device {:04x}:{:04x}",
                config.vendor, config.product
            ))
        })?;

    let mut handle = device.open().map_err(Error::Usb)?;

    let config_desc = device.active_config_descriptor().map_err(Error::Usb)?;
    let interface = config_desc
        .interfaces()
        .find(|i| i.number() == config.interface)
        .ok_or_else(|| {
            Error::Fatal(format!(
                "requested interface {} does not exist (device has {})",
                config.interface,
                config_desc.num_interfaces()
            ))
        })?;
    let setting = interface
        .descriptors()
        .find(|d| d.setting_number() == config.alt_setting)
        .ok_or_else(|| {
            Error::Fatal(format!(
                "interface {} has no alternate setting {}",
                config.interface, config.alt_setting
            ))
        })?;

    if handle.kernel_driver_active(config.interface).unwrap_or(false) {
        log::info!("a kernel driver is active on the device, taking control instead");
        handle.detach_kernel_driver(config.interface).map_err(Error::Usb)?;
    }

    handle.claim_interface(config.interface).map_err(Error::Usb)?;
    handle
        .set_alternate_setting(config.interface, config.alt_setting)
        .map_err(Error::Usb)?;

    let mut endpoints = Vec::new();
    for ep in setting.endpoint_descriptors() {
        let kind = match ep.transfer_type() {
            TransferType::Bulk => TransferKind::Bulk,
            TransferType::Interrupt => TransferKind::Interrupt,
            TransferType::Isochronous => {
                log::warn!("isochronous endpoints not supported, skipping {:#04x}", ep.number());
                continue;
            }
            TransferType::Control => {
                log::warn!("control endpoints (?!) not expected, skipping {:#04x}", ep.number());
                continue;
            }
        };
        let direction = match ep.direction() {
            RusbDirection::In => Direction::In,
            RusbDirection::Out => Direction::Out,
        };

        endpoints.push(DiscoveredEndpoint {
            address: EndpointAddress {
                number: ep.number(),
                direction,
            },
            kind,
        });
    }

    Ok(DiscoveredDevice {
        context,
        handle,
        endpoints,
    })
}
