#![no_std]
#![no_main]

use bootloader_api::{entry_point, BootInfo};
use ferrite_kernel::bootstrap;

entry_point!(kernel_main);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    bootstrap::run(boot_info)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    ferrite_kernel::serial_println!("[KERNEL PANIC] {}", info);
    ferrite_kernel::arch::halt();
}
