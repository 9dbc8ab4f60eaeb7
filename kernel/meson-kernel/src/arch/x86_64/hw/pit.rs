//! Legacy 8254 PIT: the tick source of last resort.

use crate::arch::x86_64::instructions::port::Port;

const PIT_CH0: u16 = 0x40;
const PIT_CMD: u16 = 0x43;

/// PIT input frequency in Hz.
pub const PIT_INPUT_HZ: u32 = 1_193_182;

/// Programs channel 0 for a periodic interrupt at roughly `hz`.
pub fn start_periodic(hz: u32) {
    let hz = if hz == 0 { 1000 } else { hz };
    let divisor = PIT_INPUT_HZ / hz;
    // SAFETY: Standard channel-0 mode-3 programming.
    unsafe {
        Port::<u8>::new(PIT_CMD).write(0x36); // ch0, lo/hi byte, mode 3
        Port::<u8>::new(PIT_CH0).write(divisor as u8);
        Port::<u8>::new(PIT_CH0).write((divisor >> 8) as u8);
    }
}

/// Arms channel 0 as a one-shot over `ms` milliseconds and busy-waits for
/// it to wrap. Used to calibrate the TSC when no HPET exists.
pub fn oneshot_wait_ms(ms: u32) {
    let ticks = (PIT_INPUT_HZ / 1000) * ms;
    // SAFETY: Mode-0 one-shot programming followed by counter latch reads.
    unsafe {
        Port::<u8>::new(PIT_CMD).write(0x30); // ch0, lo/hi byte, mode 0
        Port::<u8>::new(PIT_CH0).write(ticks as u8);
        Port::<u8>::new(PIT_CH0).write((ticks >> 8) as u8);

        let mut last = 0xFFFFu16;
        loop {
            Port::<u8>::new(PIT_CMD).write(0x00); // latch
            let lo = Port::<u8>::new(PIT_CH0).read();
            let hi = Port::<u8>::new(PIT_CH0).read();
            let cur = u16::from(lo) | (u16::from(hi) << 8);
            if cur > last {
                break; // wrapped: the one-shot expired
            }
            last = cur;
        }
    }
}
