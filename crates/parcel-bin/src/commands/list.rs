use super::{short_hash, Context};

pub fn list(context: &Context) -> anyhow::Result<()> {
    let packages = context.store.list_packages()?;
    if packages.is_empty() {
        println!("No packages installed in {}", context.store.objects().root().display());
        return Ok(());
    }
    for (package, hash) in packages {
        println!("{:<40} {}", package.to_string(), short_hash(&hash));
    }
    Ok(())
}
