use std::process::ExitCode;

use clap::Parser;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

use usbpiper::config::Config;
use usbpiper::devname::endpoint_devname;
use usbpiper::discovery;
use usbpiper::endpoint::Endpoint;
use usbpiper::error::Result;
use usbpiper::event_loop::EventLoop;
use usbpiper::file_state::File;
use usbpiper::usb_backend::RusbTransport;
use usbpiper::usb_transport::Direction;

fn run() -> Result<()> {
    let config = Config::parse();

    env_logger::Builder::new()
        .filter_level(config.log_level_filter())
        .init();

    let device = discovery::discover(&config)?;
    let transport = RusbTransport::new(device.context, device.handle)?;

    let mut files = Vec::new();
    for discovered in device.endpoints {
        let name = endpoint_devname(discovered.kind, discovered.address.direction, discovered.address.number);

        let fd = open("/dev/cuse", OFlag::O_RDWR, Mode::empty())
            .map_err(|e| usbpiper::error::Error::Fatal(format!("opening /dev/cuse for {}: {}", name, e)))?;

        let endpoint = Endpoint::new(discovered.address, discovered.kind);
        let (source, sink) = match discovered.address.direction {
            Direction::In => (Some(endpoint), None),
            Direction::Out => (None, Some(endpoint)),
        };

        files.push(File::new(name, fd, source, sink)?);
    }

    if files.is_empty() {
        return Err(usbpiper::error::Error::Fatal(
            "no usable bulk/interrupt endpoints found on the claimed interface".into(),
        ));
    }

    let mut event_loop = EventLoop::new(files, transport, usbpiper::endpoint::MAX_PAYLOAD)?;
    event_loop.run()
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
