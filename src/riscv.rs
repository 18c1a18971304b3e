// nothing here is safe, so don't worry about it
#![allow(clippy::missing_safety_doc)]

pub mod registers {
    /// Machine Hart (core) ID register, mhartid
    pub mod mhartid {
        use core::arch::asm;

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let id: usize;
                asm!("csrr {}, mhartid", out(reg) id);
                id
            }
        }
    }

    /// Machine Status register, mstatus
    pub mod mstatus {
        use core::arch::asm;

        pub const MPP_MASK: usize = 3 << 11;

        /// Machine Previous Privilege Mode
        pub const MPP_SUPERVISOR: usize = 1;

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let bits: usize;
                asm!("csrr {}, mstatus", out(reg) bits);
                bits
            }
        }

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw mstatus, {}", in(reg) bits);
            }
        }

        #[inline]
        pub fn set_mpp(mode: usize) {
            unsafe {
                let mut value = read();
                value &= !MPP_MASK;
                value |= mode << 11;
                write(value);
            }
        }
    }

    /// Machine Exception Program Counter, mepc
    pub mod mepc {
        use core::arch::asm;

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw mepc, {}", in(reg) bits);
            }
        }
    }

    /// Machine Exception Delegation, medeleg
    pub mod medeleg {
        use core::arch::asm;

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw medeleg, {}", in(reg) bits);
            }
        }
    }

    /// Machine Interrupt Delegation, mideleg
    pub mod mideleg {
        use core::arch::asm;

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw mideleg, {}", in(reg) bits);
            }
        }
    }

    /// Machine Interrupt Enable, mie
    pub mod mie {
        use core::arch::asm;

        /// Supervisor Timer Interrupt Enable
        pub const STIE: usize = 1 << 5;

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let bits: usize;
                asm!("csrr {}, mie", out(reg) bits);
                bits
            }
        }

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw mie, {}", in(reg) bits);
            }
        }
    }

    /// Machine Environment Configuration, menvcfg
    pub mod menvcfg {
        use core::arch::asm;

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let bits: usize;
                asm!("csrr {}, menvcfg", out(reg) bits);
                bits
            }
        }

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw menvcfg, {}", in(reg) bits);
            }
        }
    }

    /// Machine Counter Enable, mcounteren
    pub mod mcounteren {
        use core::arch::asm;

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let bits: usize;
                asm!("csrr {}, mcounteren", out(reg) bits);
                bits
            }
        }

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw mcounteren, {}", in(reg) bits);
            }
        }
    }

    /// Physical Memory Protection config and address registers
    pub mod pmp {
        use core::arch::asm;

        #[inline]
        pub unsafe fn write_cfg0(bits: usize) {
            unsafe {
                asm!("csrw pmpcfg0, {}", in(reg) bits);
            }
        }

        #[inline]
        pub unsafe fn write_addr0(bits: usize) {
            unsafe {
                asm!("csrw pmpaddr0, {}", in(reg) bits);
            }
        }
    }

    /// Supervisor Status register, sstatus
    pub mod sstatus {
        use core::arch::asm;

        /// Supervisor Previous Privilege, 1=Supervisor, 0=User
        pub const SPP: usize = 1 << 8;
        /// Supervisor Previous Interrupt Enable
        pub const SPIE: usize = 1 << 5;
        /// Supervisor Interrupt Enable
        pub const SIE: usize = 1 << 1;

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let bits: usize;
                asm!("csrr {}, sstatus", out(reg) bits);
                bits
            }
        }

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw sstatus, {}", in(reg) bits);
            }
        }
    }

    /// Supervisor Interrupt Enable, sie
    pub mod sie {
        use core::arch::asm;

        /// Supervisor External Interrupt Enable
        pub const SEIE: usize = 1 << 9;
        /// Supervisor Timer Interrupt Enable
        pub const STIE: usize = 1 << 5;
        /// Supervisor Software Interrupt Enable
        pub const SSIE: usize = 1 << 1;

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let bits: usize;
                asm!("csrr {}, sie", out(reg) bits);
                bits
            }
        }

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw sie, {}", in(reg) bits);
            }
        }
    }

    /// Supervisor Exception Program Counter, sepc
    pub mod sepc {
        use core::arch::asm;

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let bits: usize;
                asm!("csrr {}, sepc", out(reg) bits);
                bits
            }
        }

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw sepc, {}", in(reg) bits);
            }
        }
    }

    /// Supervisor Trap Cause, scause
    pub mod scause {
        use core::arch::asm;

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Trap {
            Interrupt(Interrupt),
            Exception(Exception),
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Interrupt {
            SupervisorSoftware,
            SupervisorTimer,
            SupervisorExternal,
            Unknown,
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Exception {
            InstructionAddressMisaligned,
            InstructionAccessFault,
            IllegalInstruction,
            Breakpoint,
            LoadAccessFault,
            StoreAddressMisaligned,
            StoreAccessFault,
            EnvironmentCall,
            LoadPageFault,
            StorePageFault,
            Unknown,
        }

        impl From<usize> for Interrupt {
            fn from(value: usize) -> Self {
                match value {
                    1 => Interrupt::SupervisorSoftware,
                    5 => Interrupt::SupervisorTimer,
                    9 => Interrupt::SupervisorExternal,
                    _ => Interrupt::Unknown,
                }
            }
        }

        impl From<usize> for Exception {
            fn from(value: usize) -> Self {
                match value {
                    0 => Exception::InstructionAddressMisaligned,
                    1 => Exception::InstructionAccessFault,
                    2 => Exception::IllegalInstruction,
                    3 => Exception::Breakpoint,
                    5 => Exception::LoadAccessFault,
                    6 => Exception::StoreAddressMisaligned,
                    7 => Exception::StoreAccessFault,
                    8 => Exception::EnvironmentCall,
                    13 => Exception::LoadPageFault,
                    15 => Exception::StorePageFault,
                    _ => Exception::Unknown,
                }
            }
        }

        #[derive(Debug, Clone, Copy)]
        pub struct Scause(usize);

        impl Scause {
            const INTERRUPT_BIT: usize = 1 << (usize::BITS - 1);

            pub fn bits(&self) -> usize {
                self.0
            }

            pub fn cause(&self) -> Trap {
                let code = self.0 & !Self::INTERRUPT_BIT;
                if self.0 & Self::INTERRUPT_BIT != 0 {
                    Trap::Interrupt(Interrupt::from(code))
                } else {
                    Trap::Exception(Exception::from(code))
                }
            }
        }

        impl From<usize> for Scause {
            fn from(value: usize) -> Self {
                Self(value)
            }
        }

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let bits: usize;
                asm!("csrr {}, scause", out(reg) bits);
                bits
            }
        }
    }

    /// Supervisor Trap Value, stval
    pub mod stval {
        use core::arch::asm;

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let bits: usize;
                asm!("csrr {}, stval", out(reg) bits);
                bits
            }
        }
    }

    /// Supervisor Trap-Vector Base Address, stvec
    pub mod stvec {
        use core::arch::asm;

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw stvec, {}", in(reg) bits);
            }
        }
    }

    /// Supervisor Address Translation and Protection, satp
    pub mod satp {
        use core::arch::asm;

        /// Use the Sv39 scheme.
        const SV39: usize = 8 << 60;

        /// Builds a satp value from a page table's physical address.
        pub const fn make(pagetable: usize) -> usize {
            SV39 | (pagetable >> 12)
        }

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let bits: usize;
                asm!("csrr {}, satp", out(reg) bits);
                bits
            }
        }

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw satp, {}", in(reg) bits);
            }
        }
    }

    /// Supervisor Timer Compare, stimecmp (sstc extension)
    pub mod stimecmp {
        use core::arch::asm;

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("csrw stimecmp, {}", in(reg) bits);
            }
        }
    }

    /// Machine-mode cycle counter, time
    pub mod time {
        use core::arch::asm;

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let bits: usize;
                asm!("csrr {}, time", out(reg) bits);
                bits
            }
        }
    }

    /// Thread pointer, holds this hart's id
    pub mod tp {
        use core::arch::asm;

        #[inline]
        pub unsafe fn read() -> usize {
            unsafe {
                let bits: usize;
                asm!("mv {}, tp", out(reg) bits);
                bits
            }
        }

        #[inline]
        pub unsafe fn write(bits: usize) {
            unsafe {
                asm!("mv tp, {}", in(reg) bits);
            }
        }
    }

    /// Memory management fences
    pub mod vma {
        use core::arch::asm;

        /// Flush the TLB.
        #[inline]
        pub unsafe fn sfence() {
            unsafe {
                asm!("sfence.vma zero, zero");
            }
        }
    }
}

/// Device interrupt control
pub mod interrupts {
    use super::registers::sstatus;

    /// Returns whether device interrupts are enabled.
    #[inline]
    pub fn get() -> bool {
        unsafe { sstatus::read() & sstatus::SIE != 0 }
    }

    /// Enables device interrupts.
    #[inline]
    pub fn enable() {
        unsafe { sstatus::write(sstatus::read() | sstatus::SIE) }
    }

    /// Disables device interrupts.
    #[inline]
    pub fn disable() {
        unsafe { sstatus::write(sstatus::read() & !sstatus::SIE) }
    }
}

pub const PGSIZE: usize = 4096;
pub const PGSHIFT: usize = 12;

pub const fn pg_round_up(address: usize) -> usize {
    (address + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pg_round_down(address: usize) -> usize {
    address & !(PGSIZE - 1)
}

// page table entry flags
pub const PTE_V: usize = 1 << 0; // valid
pub const PTE_R: usize = 1 << 1;
pub const PTE_W: usize = 1 << 2;
pub const PTE_X: usize = 1 << 3;
pub const PTE_U: usize = 1 << 4; // user can access

pub const fn pa_to_pte(pa: usize) -> usize {
    (pa >> 12) << 10
}

pub const fn pte_to_pa(pte: usize) -> usize {
    (pte >> 10) << 12
}

pub const fn pte_flags(pte: usize) -> usize {
    pte & 0x3FF
}

/// Extract the three 9-bit page table indices from a virtual address.
const PXMASK: usize = 0x1FF;

const fn px_shift(level: usize) -> usize {
    PGSHIFT + 9 * level
}

pub const fn px(level: usize, va: usize) -> usize {
    (va >> px_shift(level)) & PXMASK
}

/// One beyond the highest possible virtual address.
/// MAXVA is actually one bit less than the max allowed by Sv39, to avoid
/// having to sign-extend virtual addresses that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);
