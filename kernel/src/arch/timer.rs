//! Architecture-independent timer interface

/// Timer interrupt rate, in Hz. Must match whatever `setup_timer` actually
/// programs the hardware timer to (see `arch::x86_64::timer::setup_timer`).
pub const TICK_HZ: u64 = 100;

/// Get current timer tick count
pub fn get_ticks() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        crate::arch::x86_64::timer::get_ticks()
    }

    #[cfg(target_arch = "aarch64")]
    {
        crate::arch::aarch64::timer::get_ticks()
    }

    #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
    {
        crate::arch::riscv::timer::get_ticks()
    }
}

/// Wall-clock seconds since boot, derived from the tick counter. Coarse --
/// good enough for filesystem mtimes, not for anything that needs
/// sub-second precision.
pub fn get_timestamp_secs() -> u64 {
    get_ticks() / TICK_HZ
}

/// Milliseconds since boot, derived from the tick counter. Same caveats as
/// `get_timestamp_secs` -- coarse, not for sub-tick precision.
pub fn get_timestamp_ms() -> u64 {
    get_ticks() * 1000 / TICK_HZ
}
