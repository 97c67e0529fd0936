//! Kernel boot sequence: one stage per subsystem, run once from the
//! `bootloader_api` entry point.

extern crate alloc;

use crate::error::KernelResult;
use crate::{arch, fs, irq, mm, net, sched};
use bootloader_api::BootInfo;

/// Runs the boot sequence to completion. The only way out is scheduler
/// handoff into the idle loop, so this never returns.
pub fn run(boot_info: &'static mut BootInfo) -> ! {
    if let Err(e) = init(boot_info) {
        // Panic is intentional: a failure this early leaves no subsystem
        // available to recover from it.
        panic!("boot sequence failed: {:?}", e);
    }

    println!("[BOOT] handing off to scheduler");
    sched::run()
}

fn init(boot_info: &'static mut BootInfo) -> KernelResult<()> {
    println!("[BOOT] stage 1: architecture init");
    arch::init();

    println!("[BOOT] stage 2: memory management");
    mm::bootloader::init_from_boot_info(boot_info)?;

    println!("[BOOT] stage 3: interrupt dispatch");
    // The Local/IO APIC registers live behind the physical-memory window
    // `mm::init` just established, so this can't run any earlier.
    if let Err(e) = arch::x86_64::apic::init() {
        println!("[BOOT] APIC init failed ({}), falling back to the legacy PIC", e);
    }
    irq::init()?;

    println!("[BOOT] stage 4: virtual filesystem");
    fs::init();

    println!("[BOOT] stage 5: network stack");
    net::init()?;

    println!("[BOOT] stage 6: scheduler");
    sched::init();

    println!("[BOOT] sequence complete");
    Ok(())
}
