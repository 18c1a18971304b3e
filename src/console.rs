use crate::proc;
use crate::syscall::SysError;
use crate::uart;
use crate::vm::VA;

/// Outputs a character to the console.
pub fn putc(c: u8) {
    uart::putc_sync(c);
}

/// User `write()`s to the console end up here.
pub fn write(user_src: bool, src: VA, len: usize) -> Result<usize, SysError> {
    for i in 0..len {
        let src = VA::from(src.as_usize() + i);
        let mut c = [0u8];

        match proc::either_copy_in(&mut c, user_src, src) {
            Ok(_) => putc(c[0]),
            Err(_) => return Ok(i),
        }
    }

    Ok(len)
}

pub unsafe fn init() {
    uart::init();
}
