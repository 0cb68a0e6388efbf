//! QoS limits for block devices
//!
//! A storage class advertises a sustained IOPS and throughput capability.
//! Both are applied uniformly to total, read and write traffic, with a
//! burst allowance of `burst_factor` times the sustained value for
//! `burst_duration_secs` seconds.

use volplane_common::{LimitKey, Limits};

/// Compute the full set of device limits for a class capability
#[must_use]
pub fn calculate_limits(
    iops: i64,
    tps: i64,
    burst_factor: i64,
    burst_duration_secs: i64,
) -> Limits {
    let iops_burst = iops.saturating_mul(burst_factor);
    let tps_burst = tps.saturating_mul(burst_factor);

    Limits::from([
        (LimitKey::Iops, iops),
        (LimitKey::ReadIops, iops),
        (LimitKey::WriteIops, iops),
        (LimitKey::IopsBurst, iops_burst),
        (LimitKey::ReadIopsBurst, iops_burst),
        (LimitKey::WriteIopsBurst, iops_burst),
        (LimitKey::IopsBurstDuration, burst_duration_secs),
        (LimitKey::Bps, tps),
        (LimitKey::ReadBps, tps),
        (LimitKey::WriteBps, tps),
        (LimitKey::BpsBurst, tps_burst),
        (LimitKey::ReadBpsBurst, tps_burst),
        (LimitKey::WriteBpsBurst, tps_burst),
        (LimitKey::BpsBurstDuration, burst_duration_secs),
    ])
}
