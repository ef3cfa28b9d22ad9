//! Change detection against the last published release.

use crate::release::ReleaseManifest;

/// True when `version` differs from the last release's source version, or
/// when nothing has been released yet.
pub fn has_changed(version: &str, last_released: Option<&ReleaseManifest>) -> bool {
    match last_released {
        Some(manifest) => manifest.source_version != version,
        None => true,
    }
}
