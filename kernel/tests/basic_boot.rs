//! Smoke test run as a standalone bare-metal binary, independent of the
//! full boot sequence in `bootstrap::run`.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use ferrite_kernel::{exit_qemu, serial_println, QemuExitCode};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    serial_println!("basic_boot: starting");

    test_println();
    test_simple_assertion();
    test_panic_recovers_via_qemu_exit();

    serial_println!("basic_boot: all tests passed");
    exit_qemu(QemuExitCode::Success)
}

fn test_println() {
    serial_print_case("println_does_not_panic");
    serial_println!("hello from basic_boot");
    serial_println!("[ok]");
}

fn test_simple_assertion() {
    serial_print_case("simple_assertion");
    assert_eq!(1 + 1, 2);
    serial_println!("[ok]");
}

fn test_panic_recovers_via_qemu_exit() {
    serial_print_case("qemu_exit_code_is_distinct_per_outcome");
    assert_ne!(QemuExitCode::Success as u32, QemuExitCode::Failed as u32);
    serial_println!("[ok]");
}

fn serial_print_case(name: &str) {
    use ferrite_kernel::serial_print;
    serial_print!("{}...\t", name);
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("[failed]");
    serial_println!("{}", info);
    exit_qemu(QemuExitCode::Failed)
}
