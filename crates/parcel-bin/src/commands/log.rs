use parcel::PackageRef;

use super::{short_hash, Context};

#[derive(Debug, clap::Parser)]
pub struct Opt {
    /// The package, as owner/name
    package: PackageRef,
}

pub async fn log(context: &Context, opt: Opt) -> anyhow::Result<()> {
    let entries = context.registry()?.get_log(&opt.package.package()).await?;
    for entry in entries {
        let created = entry
            .created_at()
            .map(|created| created.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {created}  {}",
            console::style(short_hash(&entry.hash)).yellow(),
            entry.author
        );
    }
    Ok(())
}
