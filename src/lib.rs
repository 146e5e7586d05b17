//! A portable USB transfer engine for microcontrollers
//!
//! `usb-xfer` moves data through a USB controller in either role. As a
//! device, it answers the chapter 9 standard requests on the control
//! endpoint, and streams buffers through IN and OUT endpoints. As a host,
//! it enumerates an attached device, sends control requests, and streams
//! buffers through pipes.
//!
//! The engine talks to the controller through the capability traits in
//! [`hw`]; implement [`DeviceHardware`](hw::DeviceHardware) or
//! [`HostHardware`](hw::HostHardware) for your controller. Request and
//! descriptor codes are shared with [`usb-device`].
//!
//! The engine is polled. Interrupt handlers only record what happened in an
//! [`InterruptSource`](dispatch::InterruptSource). The foreground dispatches
//! those interrupts, and runs [`device_task`](device::device_task) or
//! [`host_task`](host::host_task), from its main loop. Every wait in the
//! engine is bounded by a software timeout that counts bus frames.
//!
//! Enable the `sim` feature for [`sim`], software controllers that run the
//! engine on a workstation.
//!
//! [`usb-device`]: https://crates.io/crates/usb-device

#![no_std]

#[cfg(test)]
extern crate std;

#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;

pub mod context;
pub mod device;
pub mod dispatch;
pub mod events;
pub mod host;
pub mod hw;
pub mod request;
pub mod stream;
pub mod timeout;

#[cfg(any(test, feature = "sim"))]
pub mod sim;
