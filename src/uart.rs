use core::ptr;
use core::sync::atomic::Ordering;

use crate::memlayout::UART0;
use crate::printf::PRINTF;

// UART control registers are memory-mapped at address UART0.
// http://byterunner.com/16550.html

/// Transmit Holding Register (for output bytes)
const THR: usize = 0;

/// Interrupt Enable Register
const IER: usize = 1;

/// FIFO Control Register
const FCR: usize = 2;
const FCR_FIFO_ENABLE: u8 = 1 << 0;
/// Clear the content of the two FIFOs
const FCR_FIFO_CLEAR: u8 = 3 << 1;

/// Line Control Register
const LCR: usize = 3;
const LCR_EIGHT_BITS: u8 = 3;
/// Special mode to set baud rate
const LCR_BAUD_LATCH: u8 = 1 << 7;

/// Line Status Register
const LSR: usize = 5;
/// THR can accept another character to send
const LSR_TX_IDLE: u8 = 1 << 5;

/// Read a byte from the given UART register.
fn read(reg: usize) -> u8 {
    // Safety: reading from a memory-mapped UART register
    unsafe { ptr::read_volatile((UART0 as *mut u8).add(reg)) }
}

/// Write a byte to the given UART register.
fn write(reg: usize, value: u8) {
    // Safety: writing to a memory-mapped UART register
    unsafe { ptr::write_volatile((UART0 as *mut u8).add(reg), value) }
}

/// Initialize the UART to 38.4K baud, 8 data bits, no parity, one stop bit.
///
/// Output is driven synchronously; the transmit interrupt stays disabled.
pub fn init() {
    // disable interrupts
    write(IER, 0x00);

    // special mode to set baud rate
    write(LCR, LCR_BAUD_LATCH);

    // LSB for baud rate of 38.4K
    write(0, 0x03);

    // MSB for baud rate of 38.4K
    write(1, 0x00);

    // leave set-baud mode and set word length to 8 bits, no parity
    write(LCR, LCR_EIGHT_BITS);

    // reset and enable FIFOs
    write(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);
}

/// Writes a character to the UART, spinning until the transmitter is free.
///
/// Used by the kernel printf and echoes; it is polled and does not need the
/// UART interrupt to make progress.
pub fn putc_sync(c: u8) {
    if PRINTF.is_panicked().load(Ordering::Relaxed) {
        #[allow(clippy::empty_loop)]
        loop {}
    }

    // wait for Transmit Holding Empty to be set in LSR
    while read(LSR) & LSR_TX_IDLE == 0 {
        core::hint::spin_loop();
    }

    write(THR, c);
}
