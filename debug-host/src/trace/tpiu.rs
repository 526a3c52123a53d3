//! TPIU register map.
//!
//! See the ARM CoreSight Components TRM, chapter "Trace Port Interface Unit".

use bitfield::bitfield;

use super::PinProtocol;

/// Default base address of the TPIU on Cortex-M devices.
pub const DEFAULT_TPIU_BASE: u64 = 0xE004_0000;

/// Supported Parallel Port Size Register.
pub const TPIU_SSPSR_OFFSET: u64 = 0x000;
/// Current Parallel Port Size Register.
pub const TPIU_CSPSR_OFFSET: u64 = 0x004;
/// Asynchronous Clock Prescaler Register.
pub const TPIU_ACPR_OFFSET: u64 = 0x010;
/// Selected Pin Protocol Register.
pub const TPIU_SPPR_OFFSET: u64 = 0x0f0;
/// Formatter and Flush Status Register.
pub const TPIU_FFSR_OFFSET: u64 = 0x300;
/// Formatter and Flush Control Register.
pub const TPIU_FFCR_OFFSET: u64 = 0x304;
/// Formatter Synchronization Counter Register.
pub const TPIU_FSCR_OFFSET: u64 = 0x308;
/// Device configuration register.
pub const TPIU_DEVID_OFFSET: u64 = 0xfc8;

/// Largest value the 13 bit `ACPR` prescaler field can hold.
pub const TPIU_ACPR_MAX_PRESCALER: u32 = 0x1fff;

bitfield! {
    /// TPIU_DEVID - describes which pin protocols the TPIU implements.
    #[derive(Copy, Clone)]
    pub struct Devid(u32);
    impl Debug;
    /// The parallel trace port is NOT supported.
    pub nosupport_sync, _: 9;
    /// Manchester encoded SWO is supported.
    pub support_manchester, _: 10;
    /// NRZ (UART) encoded SWO is supported.
    pub support_uart, _: 11;
}

impl Devid {
    /// Whether the TPIU can drive the trace port with `protocol`.
    pub fn supports(&self, protocol: PinProtocol) -> bool {
        match protocol {
            PinProtocol::Sync => !self.nosupport_sync(),
            PinProtocol::Manchester => self.support_manchester(),
            PinProtocol::Uart => self.support_uart(),
        }
    }
}

bitfield! {
    /// TPIU_FFCR - formatter and flush control.
    #[derive(Copy, Clone)]
    pub struct Ffcr(u32);
    impl Debug;
    /// Continuous formatting.
    pub enfcont, set_enfcont: 1;
}

/// Prescaler dividing `traceclkin` down to the closest achievable `pin_freq`.
pub fn prescaler(traceclkin: u32, pin_freq: u32) -> u32 {
    if pin_freq == 0 {
        return 1;
    }
    let rounded = (u64::from(traceclkin) + u64::from(pin_freq / 2)) / u64::from(pin_freq);
    rounded.clamp(1, u64::from(TPIU_ACPR_MAX_PRESCALER)) as u32
}

/// `CSPSR` value selecting a port of `width` pins.
pub fn port_size_bit(width: u32) -> u32 {
    1 << (width - 1)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::{port_size_bit, prescaler, Devid, Ffcr};
    use crate::trace::PinProtocol;

    #[test_case(0x000, true, false, false; "sync only")]
    #[test_case(0xa00, false, false, true; "uart only")]
    #[test_case(0xc00, true, true, true; "everything")]
    fn devid_protocols(devid: u32, sync: bool, manchester: bool, uart: bool) {
        let devid = Devid(devid);
        assert_eq!(devid.supports(PinProtocol::Sync), sync);
        assert_eq!(devid.supports(PinProtocol::Manchester), manchester);
        assert_eq!(devid.supports(PinProtocol::Uart), uart);
    }

    #[test_case(72_000_000, 2_000_000, 36)]
    #[test_case(64_000_000, 3_000_000, 21; "rounds to nearest")]
    #[test_case(100_000_000, 1_000, 0x1fff; "clamped to field width")]
    #[test_case(1_000_000, 4_000_000, 1; "never zero")]
    fn prescaler_values(traceclkin: u32, pin_freq: u32, expected: u32) {
        assert_eq!(prescaler(traceclkin, pin_freq), expected);
    }

    #[test]
    fn formatter_bit() {
        let mut ffcr = Ffcr(0x100);
        ffcr.set_enfcont(true);
        assert_eq!(ffcr.0, 0x102);
        ffcr.set_enfcont(false);
        assert_eq!(ffcr.0, 0x100);
    }

    #[test]
    fn port_sizes() {
        assert_eq!(port_size_bit(1), 0x1);
        assert_eq!(port_size_bit(4), 0x8);
        assert_eq!(port_size_bit(32), 0x8000_0000);
    }
}
