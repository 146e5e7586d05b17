//! Simulated endpoint and pipe registers
//!
//! Each simulated endpoint and pipe owns a small register block, laid out
//! like the AVR8 USB controller's per-endpoint registers. Access goes
//! through the `ral-registers` macros.

#![allow(non_snake_case, non_upper_case_globals)]

use core::cell::UnsafeCell;

pub use ral_registers::{modify_reg, read_reg, write_reg};

/// Volatile cell that conforms to the RAL's register API
#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        // Safety: the cell is never shared across threads (VCell is !Sync),
        // and no reference into it escapes.
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        // Safety: see read.
        unsafe { self.0.get().write_volatile(val) }
    }
}

/// Device endpoint registers
#[repr(C)]
pub struct EndpointRegisters {
    /// Endpoint interrupt (status) flags
    pub UEINTX: VCell<u32>,
    /// Endpoint control
    pub UECONX: VCell<u32>,
}

impl EndpointRegisters {
    pub const fn new() -> Self {
        EndpointRegisters {
            UEINTX: VCell::new(0),
            UECONX: VCell::new(0),
        }
    }
}

pub mod UEINTX {
    /// IN bank ready for data
    pub mod TXINI {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// OUT bank holds a received packet
    pub mod RXOUTI {
        pub const offset: u32 = 2;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Control bank holds a SETUP packet
    pub mod RXSTPI {
        pub const offset: u32 = 3;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod UECONX {
    /// Endpoint enabled
    pub mod EPEN {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Stall request
    pub mod STALLRQ {
        pub const offset: u32 = 5;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

/// Host pipe registers
#[repr(C)]
pub struct PipeRegisters {
    /// Pipe interrupt (status) flags
    pub UPINTX: VCell<u32>,
    /// Pipe control
    pub UPCONX: VCell<u32>,
    /// Pipe configuration
    pub UPCFG0X: VCell<u32>,
}

impl PipeRegisters {
    pub const fn new() -> Self {
        PipeRegisters {
            UPINTX: VCell::new(0),
            UPCONX: VCell::new(0),
            UPCFG0X: VCell::new(0),
        }
    }
}

pub mod UPINTX {
    /// IN bank holds a received packet
    pub mod RXINI {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// STALL handshake received
    pub mod RXSTALLI {
        pub const offset: u32 = 1;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// OUT bank ready for data
    pub mod TXOUTI {
        pub const offset: u32 = 2;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// SETUP packet acknowledged
    pub mod TXSTPI {
        pub const offset: u32 = 3;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Pipe error
    pub mod PERRI {
        pub const offset: u32 = 4;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod UPCONX {
    /// Pipe enabled
    pub mod PEN {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Pipe frozen
    pub mod PFREEZE {
        pub const offset: u32 = 6;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod UPCFG0X {
    /// Token issued by the pipe
    pub mod PTOKEN {
        pub const offset: u32 = 4;
        pub const mask: u32 = 0b11 << offset;
        pub mod RW {
            pub const SETUP: u32 = 0b00;
            pub const IN: u32 = 0b01;
            pub const OUT: u32 = 0b10;
        }
        pub mod R {}
        pub mod W {}
    }
}

#[cfg(test)]
mod tests {
    use super::{modify_reg, read_reg, write_reg, EndpointRegisters, PipeRegisters};

    #[test]
    fn endpoint_flags() {
        let regs = EndpointRegisters::new();
        write_reg!(crate::sim::registers, &regs, UEINTX, TXINI: 1, RXSTPI: 1);
        assert_eq!(regs.UEINTX.read(), 0b1001);
        modify_reg!(crate::sim::registers, &regs, UEINTX, RXSTPI: 0);
        assert!(read_reg!(crate::sim::registers, &regs, UEINTX, TXINI == 1));
        assert!(read_reg!(crate::sim::registers, &regs, UEINTX, RXSTPI == 0));

        modify_reg!(crate::sim::registers, &regs, UECONX, STALLRQ: 1);
        assert_eq!(regs.UECONX.read(), 1 << 5);
    }

    #[test]
    fn pipe_token_field() {
        let regs = PipeRegisters::new();
        modify_reg!(crate::sim::registers, &regs, UPCFG0X, PTOKEN: OUT);
        assert_eq!(read_reg!(crate::sim::registers, &regs, UPCFG0X, PTOKEN), 0b10);
        modify_reg!(crate::sim::registers, &regs, UPCFG0X, PTOKEN: IN);
        assert!(read_reg!(crate::sim::registers, &regs, UPCFG0X, PTOKEN == IN));
    }
}
