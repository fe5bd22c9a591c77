use parcel::PackageRef;

use super::{short_hash, Context};

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// List the versions of a package
    List {
        /// The package, as owner/name
        package: PackageRef,
    },

    /// Create a version. Versions are permanent and must follow PEP 440
    Add {
        /// The package, as owner/name
        package: PackageRef,
        /// The version to create
        version: String,
        /// The full or abbreviated package hash
        hash: String,
    },
}

pub async fn run(context: &Context, command: Command) -> anyhow::Result<()> {
    let registry = context.registry()?;
    match command {
        Command::List { package } => {
            for entry in registry.list_versions(&package.package()).await? {
                println!("{:<20} {}", entry.version, short_hash(&entry.hash));
            }
        }
        Command::Add {
            package,
            version,
            hash,
        } => {
            // Fail on a bad version before resolving the hash.
            parcel_registry::validate_version(&version)?;
            let package = package.package();
            let hash = registry.resolve_hash(&package, &hash).await?;
            registry.put_version(&package, &version, &hash).await?;
            println!("{package}:v:{version} -> {hash:x}");
        }
    }
    Ok(())
}
