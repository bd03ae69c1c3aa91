#![no_std]
#![no_main]
#![allow(nonstandard_style, dead_code, unused_unsafe)]

mod helpers;
mod lifecycle;
mod maps;
mod sample;
#[allow(clippy::all)]
mod vmlinux;

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[no_mangle]
#[link_section = "license"]
pub static LICENSE: [u8; 4] = *b"GPL\0";
