//! Binary entry point.
//!
//! [`pen_os::entry_point!`] supplies the multiboot header and `_start`
//! trampoline; this crate only needs to exist so `cargo build --bin
//! pen_os` produces a freestanding image calling straight into
//! [`pen_os::kernel_main`]. Not built under `cargo test` (`test = false`
//! in `Cargo.toml`) — every test lives either in the library's own
//! `#[cfg(test)]` modules or as its own binary under `tests/`.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

pen_os::entry_point!(pen_os::kernel_main);

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    pen_os::println!("{}", info);
    pen_os::panic::halt_forever();
}
