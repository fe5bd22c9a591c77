use parcel::PackageRef;

use super::Context;

#[derive(Debug, clap::Parser)]
pub struct Opt {
    /// The package, as owner/name
    package: PackageRef,
}

pub fn remove(context: &Context, opt: Opt) -> anyhow::Result<()> {
    let package = opt.package.package();
    if context.store.remove_package(&package)? {
        println!("Removed {package}");
    } else {
        anyhow::bail!("{package} is not installed");
    }
    Ok(())
}
