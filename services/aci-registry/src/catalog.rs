//! Catalog of published images, rebuilt from a flat storage listing.
//!
//! Published artifacts are named `<name>-<version>-<os>-<arch>.aci`, with an
//! optional detached signature at the same name plus `.asc`. Anything else in
//! the listing is ignored.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

const SIGNATURE_SUFFIX: &str = ".asc";

/// A single file as reported by a blob store listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    /// Name relative to the published namespace, e.g. `example.com/app-1.0.0-linux-amd64.aci`.
    pub name: String,

    /// Last modification time reported by the backend.
    pub modified: DateTime<Utc>,
}

impl RawEntry {
    /// Create a raw entry.
    pub fn new(name: impl Into<String>, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            modified,
        }
    }
}

/// One published image name and all of its versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Image {
    /// Image name, e.g. `example.com/app`.
    pub name: String,

    /// Published versions of this image.
    pub versions: Vec<ImageVersion>,
}

/// A single published artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageVersion {
    /// Version token, e.g. `1.0.0` or `latest`.
    pub version: String,

    /// Target operating system.
    pub os: String,

    /// Target architecture.
    pub arch: String,

    /// Whether a detached signature was published alongside the image.
    pub signed: bool,

    /// Modification time of the image file itself.
    pub last_modified: DateTime<Utc>,
}

/// A catalog of published images.
pub type Catalog = Vec<Image>;

#[derive(Debug, Default)]
struct Gathered {
    image: Option<DateTime<Utc>>,
    signed: bool,
}

struct ArtifactName<'n> {
    name: &'n str,
    version: &'n str,
    os: &'n str,
    arch: &'n str,
}

fn parse(name: &str) -> Option<ArtifactName<'_>> {
    let tokens: Vec<&str> = name.split('-').collect();
    let [name, version, os, last] = tokens[..] else {
        return None;
    };

    let parts: Vec<&str> = last.split('.').collect();
    let [arch, "aci"] = parts[..] else {
        return None;
    };

    Some(ArtifactName {
        name,
        version,
        os,
        arch,
    })
}

/// Build a catalog from a raw listing.
///
/// Images are sorted by name and versions by their file name, so the output is
/// stable for a given input.
pub fn build<I>(entries: I) -> Catalog
where
    I: IntoIterator<Item = RawEntry>,
{
    let mut gathered: BTreeMap<String, Gathered> = BTreeMap::new();

    for entry in entries {
        match entry.name.strip_suffix(SIGNATURE_SUFFIX) {
            Some(base) => gathered.entry(base.to_owned()).or_default().signed = true,
            None => gathered.entry(entry.name).or_default().image = Some(entry.modified),
        }
    }

    let mut images: BTreeMap<&str, Vec<ImageVersion>> = BTreeMap::new();

    for (file, found) in &gathered {
        let Some(modified) = found.image else {
            continue;
        };

        let Some(artifact) = parse(file) else {
            tracing::trace!(%file, "skipping malformed artifact name");
            continue;
        };

        images.entry(artifact.name).or_default().push(ImageVersion {
            version: artifact.version.to_owned(),
            os: artifact.os.to_owned(),
            arch: artifact.arch.to_owned(),
            signed: found.signed,
            last_modified: modified,
        });
    }

    images
        .into_iter()
        .map(|(name, versions)| Image {
            name: name.to_owned(),
            versions,
        })
        .collect()
}
