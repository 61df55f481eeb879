//! Legacy I/O port space.
//!
//! ```text
//! 0x0020-0x0021   PIC #1 (command, data)
//! 0x0402          QEMU debug console
//! ```

use crate::logger::DEBUG_CONSOLE_PORT;

/// PIC #1 command port.
pub const PIC1_COMMAND: u16 = 0x20;

/// PIC #1 data port; writes set the interrupt mask.
pub const PIC1_DATA: u16 = 0x21;

/// End-of-interrupt command for the PIC.
pub const PIC_EOI: u8 = 0x20;

/// Write one byte to an I/O port.
///
/// # Safety
/// Must run at CPL0, and `port` must be a writable register of a device that
/// expects `val` in its current state.
#[inline]
pub unsafe fn outb(port: u16, val: u8) {
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") val, options(nomem, nostack, preserves_flags));
    }
}

/// Read one byte from an I/O port.
///
/// # Safety
/// Must run at CPL0, and `port` must be a readable register of a present device.
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    let mut v: u8;
    unsafe {
        core::arch::asm!("in al, dx", in("dx") port, out("al") v, options(nomem, nostack, preserves_flags));
    }
    v
}

/// Byte sink for [`PortLogger`](crate::logger::PortLogger).
pub fn debug_console_write(byte: u8) {
    // SAFETY: the debug console accepts any byte; without one the write is dropped.
    unsafe { outb(DEBUG_CONSOLE_PORT, byte) }
}

/// Acknowledges the interrupt being handled.
pub fn pic_end_of_interrupt() {
    // SAFETY: EOI is valid while servicing a PIC interrupt.
    unsafe { outb(PIC1_COMMAND, PIC_EOI) }
}

/// Sets or clears IRQ `line` in the PIC #1 mask.
pub fn pic_set_masked(line: u8, masked: bool) {
    // SAFETY: read-modify-write of the mask register only.
    unsafe {
        let mask = inb(PIC1_DATA);
        let mask = if masked {
            mask | (1 << line)
        } else {
            mask & !(1 << line)
        };
        outb(PIC1_DATA, mask);
    }
}
