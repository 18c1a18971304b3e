#![no_std]
#![no_main]

use user::*;

#[unsafe(no_mangle)]
fn main(_args: Args) {
    // Every parentless process in the system ends up as our child; reap
    // them forever. This is the Rust source of the flat /init image the
    // kernel ships.
    loop {
        let _ = wait(None);
    }
}
