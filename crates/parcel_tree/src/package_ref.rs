//! Parsing of package references such as `owner/name/sub/path:t:stable`.

use std::{fmt, str::FromStr};

use serde_with::{DeserializeFromStr, SerializeDisplay};

/// The tag that is moved to the newest package instance on every push.
pub const LATEST_TAG: &str = "latest";

/// An error that is returned when a package reference cannot be parsed.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PackageRefError {
    /// The reference does not have the form `owner/name`.
    #[error("'{0}' is not a valid package reference, expected 'owner/name'")]
    MissingName(String),

    /// The owner or the package name contains invalid characters.
    #[error("'{0}' is not a valid name, names must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidName(String),

    /// A subpath was given where it is not allowed.
    #[error("'{0}' cannot contain a subpath")]
    SubpathNotAllowed(String),

    /// The selector suffix is not one of `:h:`, `:v:` or `:t:`.
    #[error("'{0}' is not a valid selector, expected ':h:<hash>', ':v:<version>' or ':t:<tag>'")]
    InvalidSelector(String),
}

/// Returns true if `name` is a valid owner or package name.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Identifies a package, and optionally a node inside it, by `owner/name[/sub/path]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct PackageRef {
    /// The owner of the package.
    pub owner: String,
    /// The name of the package.
    pub name: String,
    /// The path components of a node inside the package. Empty for the whole package.
    pub subpath: Vec<String>,
}

impl PackageRef {
    /// Constructs a reference to a whole package, validating both names.
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, PackageRefError> {
        let owner = owner.into();
        let name = name.into();
        for part in [&owner, &name] {
            if !is_valid_name(part) {
                return Err(PackageRefError::InvalidName(part.clone()));
            }
        }
        Ok(Self {
            owner,
            name,
            subpath: Vec::new(),
        })
    }

    /// Parses a reference that must not contain a subpath.
    pub fn parse_package(source: &str) -> Result<Self, PackageRefError> {
        let package = Self::from_str(source)?;
        if !package.subpath.is_empty() {
            return Err(PackageRefError::SubpathNotAllowed(source.to_string()));
        }
        Ok(package)
    }

    /// Returns the subpath joined with slashes.
    pub fn subpath_str(&self) -> String {
        self.subpath.join("/")
    }

    /// Returns a reference to the whole package, dropping the subpath.
    pub fn package(&self) -> PackageRef {
        PackageRef {
            owner: self.owner.clone(),
            name: self.name.clone(),
            subpath: Vec::new(),
        }
    }
}

impl FromStr for PackageRef {
    type Err = PackageRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches('/');
        let mut parts = trimmed.split('/');
        let (Some(owner), Some(name)) = (parts.next(), parts.next()) else {
            return Err(PackageRefError::MissingName(s.to_string()));
        };
        let mut package = PackageRef::new(owner, name)?;
        for component in parts {
            if !is_valid_name(component) {
                return Err(PackageRefError::InvalidName(component.to_string()));
            }
            package.subpath.push(component.to_string());
        }
        Ok(package)
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)?;
        for component in &self.subpath {
            write!(f, "/{component}")?;
        }
        Ok(())
    }
}

/// Selects one instance of a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    /// A full or abbreviated package hash.
    Hash(String),
    /// An immutable version.
    Version(String),
    /// A mutable tag.
    Tag(String),
}

impl Default for Selector {
    fn default() -> Self {
        Selector::Tag(LATEST_TAG.to_string())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Hash(hash) => write!(f, ":h:{hash}"),
            Selector::Version(version) => write!(f, ":v:{version}"),
            Selector::Tag(tag) => write!(f, ":t:{tag}"),
        }
    }
}

/// A package reference together with an optional [`Selector`], written as
/// `owner/name[/sub/path][:h:<hash>|:v:<version>|:t:<tag>]`. The long forms
/// `:hash:`, `:version:` and `:tag:` are accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct PackageSpec {
    /// The package (and subpath) to install.
    pub package: PackageRef,
    /// Which instance of the package to install. `None` means the latest tag.
    pub selector: Option<Selector>,
}

impl PackageSpec {
    /// Returns the selector, defaulting to the `latest` tag.
    pub fn selector_or_default(&self) -> Selector {
        self.selector.clone().unwrap_or_default()
    }
}

impl FromStr for PackageSpec {
    type Err = PackageRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some((package, selector)) = s.split_once(':') else {
            return Ok(PackageSpec {
                package: s.parse()?,
                selector: None,
            });
        };

        let invalid = || PackageRefError::InvalidSelector(format!(":{selector}"));
        let (kind, value) = selector.split_once(':').ok_or_else(invalid)?;
        if value.is_empty() {
            return Err(invalid());
        }
        let selector = match kind {
            "h" | "hash" => Selector::Hash(value.to_string()),
            "v" | "version" => Selector::Version(value.to_string()),
            "t" | "tag" => Selector::Tag(value.to_string()),
            _ => return Err(invalid()),
        };

        Ok(PackageSpec {
            package: package.parse()?,
            selector: Some(selector),
        })
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.package)?;
        if let Some(selector) = &self.selector {
            write!(f, "{selector}")?;
        }
        Ok(())
    }
}
