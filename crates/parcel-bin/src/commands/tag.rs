use parcel::PackageRef;

use super::{short_hash, Context};

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// List the tags of a package
    List {
        /// The package, as owner/name
        package: PackageRef,
    },

    /// Point a tag at an instance of a package
    Add {
        /// The package, as owner/name
        package: PackageRef,
        /// The tag to create or move
        tag: String,
        /// The full or abbreviated package hash
        hash: String,
    },

    /// Delete a tag
    Remove {
        /// The package, as owner/name
        package: PackageRef,
        /// The tag to delete
        tag: String,
    },
}

pub async fn run(context: &Context, command: Command) -> anyhow::Result<()> {
    let registry = context.registry()?;
    match command {
        Command::List { package } => {
            for entry in registry.list_tags(&package.package()).await? {
                println!("{:<20} {}", entry.tag, short_hash(&entry.hash));
            }
        }
        Command::Add { package, tag, hash } => {
            let package = package.package();
            let hash = registry.resolve_hash(&package, &hash).await?;
            registry.put_tag(&package, &tag, &hash).await?;
            println!("{package}:t:{tag} -> {hash:x}");
        }
        Command::Remove { package, tag } => {
            registry.delete_tag(&package.package(), &tag).await?;
            println!("Removed tag {tag} from {}", package.package());
        }
    }
    Ok(())
}
