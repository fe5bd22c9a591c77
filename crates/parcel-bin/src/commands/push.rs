use parcel::{PackageRef, PushOptions};

use super::Context;

#[derive(Debug, clap::Parser)]
pub struct Opt {
    /// The package to push, as owner/name
    package: PackageRef,

    /// Make the package readable by everyone
    #[clap(long)]
    public: bool,

    /// Upload every object, even if the registry already stores it
    #[clap(long)]
    reupload: bool,

    /// A description of this instance of the package
    #[clap(long, default_value = "")]
    description: String,
}

pub async fn push(context: &Context, opt: Opt) -> anyhow::Result<()> {
    let options = PushOptions {
        public: opt.public,
        reupload: opt.reupload,
        description: opt.description,
    };
    let result = parcel::push(
        &context.store,
        &context.registry()?,
        &opt.package,
        &options,
        Some(context.reporter()?),
    )
    .await?;

    println!(
        "{} {} at {:x} ({} uploaded, {} already present)",
        console::style("Pushed").green(),
        opt.package.package(),
        result.hash,
        result.uploaded,
        result.skipped
    );
    Ok(())
}
