use std::net::Ipv4Addr;

use crate::error::NetError;

/// Parse `a.b.c.d/len` into the address and its netmask
pub fn parse_ip_cidr(ip_cidr: &str) -> Result<(Ipv4Addr, Ipv4Addr), NetError> {
    let invalid = || NetError::InvalidAddress(ip_cidr.to_string());

    let (addr, prefix) = ip_cidr.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let prefix_len: u32 = prefix.parse().map_err(|_| invalid())?;
    if prefix_len > 32 {
        return Err(invalid());
    }

    let mask = u32::MAX.checked_shl(32 - prefix_len).unwrap_or(0);
    Ok((addr, Ipv4Addr::from(mask)))
}
