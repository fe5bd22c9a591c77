use std::path::PathBuf;

use parcel::{InstallOptions, PackageSpec, Requirements};

use super::Context;

#[derive(Debug, clap::Parser)]
pub struct Opt {
    /// Packages to install, as owner/name[/sub/path][:h:<hash>|:v:<version>|:t:<tag>].
    /// An argument of the form @<file> reads a YAML requirements file.
    #[clap(required_unless_present = "requirements")]
    specs: Vec<String>,

    /// A YAML requirements file listing the packages to install
    #[clap(short, long)]
    requirements: Option<PathBuf>,

    /// Replace packages that are already installed
    #[clap(long)]
    force: bool,
}

pub async fn install(context: &Context, opt: Opt) -> anyhow::Result<()> {
    let mut requirements = match &opt.requirements {
        Some(path) => Requirements::from_path(path)?,
        None => Requirements::default(),
    };
    for spec in &opt.specs {
        if spec.starts_with('@') {
            requirements
                .packages
                .extend(Requirements::from_argument(spec)?.packages);
        } else {
            requirements.packages.push(spec.parse::<PackageSpec>()?);
        }
    }

    let results = parcel::install_requirements(
        &context.store,
        &context.registry()?,
        &requirements,
        InstallOptions { force: opt.force },
        Some(context.reporter()?),
    )
    .await?;

    for result in results {
        let status = if result.unchanged {
            console::style("Up to date").dim()
        } else {
            console::style("Installed").green()
        };
        println!(
            "{status} {} at {:x} ({} downloaded, {} reused)",
            result.package, result.hash, result.downloaded, result.reused
        );
    }
    Ok(())
}
