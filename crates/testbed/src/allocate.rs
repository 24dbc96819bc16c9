//! Machine id, bridge name and management address allocation

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Smallest id `>= initial_id` not present in `occupied`
pub fn lowest_free_id(initial_id: u32, occupied: &BTreeSet<u32>) -> Result<u32> {
    let mut candidate = initial_id;
    // Ordered iteration: walk the occupied run starting at `initial_id`
    for &id in occupied.range(initial_id..) {
        if id != candidate {
            break;
        }
        candidate = candidate.checked_add(1).ok_or_else(|| {
            Error::InvalidArgument(format!("no free id at or above {initial_id}"))
        })?;
    }
    Ok(candidate)
}

/// Smallest numeric suffix, from 0, not used by a name starting with `prefix`
///
/// Names whose suffix is not a plain number are ignored.
pub fn lowest_free_suffix<'a, I>(prefix: &str, names: I) -> Result<u32>
where
    I: IntoIterator<Item = &'a str>,
{
    let occupied: BTreeSet<u32> = names
        .into_iter()
        .filter_map(|name| name.strip_prefix(prefix))
        .filter(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|suffix| suffix.parse().ok())
        .collect();

    lowest_free_id(0, &occupied)
}

/// Offset `base` by `delta` addresses within the same family
pub fn offset_address(base: IpAddr, delta: u64) -> Result<IpAddr> {
    let overflow = || Error::AddressOverflow { base, delta };

    match base {
        IpAddr::V4(v4) => {
            let delta = u32::try_from(delta).map_err(|_| overflow())?;
            let value = u32::from(v4).checked_add(delta).ok_or_else(overflow)?;
            Ok(IpAddr::V4(Ipv4Addr::from(value)))
        }
        IpAddr::V6(v6) => {
            let value = u128::from(v6)
                .checked_add(u128::from(delta))
                .ok_or_else(overflow)?;
            Ok(IpAddr::V6(Ipv6Addr::from(value)))
        }
    }
}

/// Management address of the machine with `assigned_id`
pub fn management_address(base: IpAddr, initial_id: u32, assigned_id: u32) -> Result<IpAddr> {
    let delta = assigned_id.checked_sub(initial_id).ok_or_else(|| {
        Error::InvalidArgument(format!(
            "machine id {assigned_id} is below the initial id {initial_id}"
        ))
    })?;
    offset_address(base, u64::from(delta))
}
