//! Device size rounding.
//!
//! Backend devices are allocated in whole MiB below 1 GiB and in whole GiB
//! from 1 GiB upwards.

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Round a requested size up to the allocation granularity.
///
/// `round_size(round_size(x)) == round_size(x)` and `round_size(x) >= x`
/// for every `x`.
#[must_use]
pub const fn round_size(bytes: u64) -> u64 {
    let unit = if bytes < GIB { MIB } else { GIB };
    bytes.div_ceil(unit).saturating_mul(unit)
}
