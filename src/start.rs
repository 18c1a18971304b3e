use core::arch::asm;

use crate::param::NCPU;
use crate::riscv::registers::*;

#[repr(C, align(16))]
struct Stack([u8; 4096 * NCPU]);

#[unsafe(no_mangle)]
static mut STACK0: Stack = Stack([0; 4096 * NCPU]);

unsafe extern "C" {
    fn main() -> !;
}

/// Ask each hart to generate timer interrupts.
unsafe fn timer_init() {
    unsafe {
        // enable supervisor-mode timer interrupts.
        mie::write(mie::read() | mie::STIE);

        // enable the sstc extension (i.e. stimecmp).
        menvcfg::write(menvcfg::read() | (1 << 63));

        // allow supervisor to use stimecmp and time.
        mcounteren::write(mcounteren::read() | 2);

        // ask for the very first timer interrupt.
        stimecmp::write(time::read() + 1_000_000);
    }
}

/// entry.rs jumps here in machine mode on each hart's boot stack.
///
/// # Safety
/// Runs once per hart, before anything else.
pub unsafe fn start() -> ! {
    unsafe {
        // set M Previous Privilege mode to Supervisor, for mret.
        mstatus::set_mpp(mstatus::MPP_SUPERVISOR);

        // set M Exception Program Counter to main, for mret.
        mepc::write(main as *const () as usize);

        // disable paging for now.
        satp::write(0);

        // delegate all interrupts and exceptions to supervisor mode.
        medeleg::write(0xFFFF);
        mideleg::write(0xFFFF);
        sie::write(sie::read() | sie::SEIE | sie::STIE | sie::SSIE);

        // configure Physical Memory Protection to give supervisor mode
        // access to all of physical memory.
        pmp::write_addr0(0x3F_FFFF_FFFF_FFFF);
        pmp::write_cfg0(0xF);

        timer_init();

        // keep each CPU's hartid in its tp register, for CPU_TABLE.
        tp::write(mhartid::read());

        // switch to supervisor mode and jump to main().
        asm!("mret", options(noreturn));
    }
}
