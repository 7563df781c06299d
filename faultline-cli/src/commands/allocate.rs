//! Print sequential addresses from a subnet.

use anyhow::{Context, Result};
use faultline_core::NetworkAddressSpace;

/// Run the allocate command.
pub fn run(gateway: &str, subnet: &str, count: u32) -> Result<()> {
    let mut space = NetworkAddressSpace::parse(gateway, subnet).context("Invalid address space")?;

    for _ in 0..count {
        let address = space.next_address().context("Cannot allocate address")?;
        println!("{}", address);
    }

    tracing::info!("{} address(es) left in {}", space.remaining(), space);
    Ok(())
}
