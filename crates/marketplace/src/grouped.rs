//! The grouped installed-and-available view.
//!
//! Installed extensions and marketplace entries are merged by base-id; each
//! group lists the union of versions, semver-descending, with `is_latest`
//! on the highest non-deprecated version.

use std::collections::BTreeMap;

use extension_store::{ExtensionInfo, extract_base_id};
use semver::Version;

use crate::MarketplaceEntry;

#[derive(Debug, Clone, PartialEq)]
pub struct VersionRow {
    pub version: String,
    pub installed: bool,
    pub published_date: Option<String>,
    pub deprecated: bool,
    pub foxe: Option<String>,
    pub is_latest: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionGroup {
    pub base_id: String,
    pub display_name: String,
    /// Any version installed.
    pub installed: bool,
    pub versions: Vec<VersionRow>,
}

/// Order versions semver-descending; unparseable versions sort last, in
/// reverse lexical order among themselves.
fn version_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(va), Ok(vb)) => vb.cmp(&va),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => b.cmp(a),
    }
}

/// Merge installed extensions and marketplace entries into groups keyed by
/// base-id, sorted by display name.
pub fn grouped_view(
    installed: &[ExtensionInfo],
    entries: &[MarketplaceEntry],
) -> Vec<ExtensionGroup> {
    struct Draft {
        display_name: String,
        versions: BTreeMap<String, VersionRow>,
    }
    let mut drafts: BTreeMap<String, Draft> = BTreeMap::new();

    for entry in entries {
        let base_id = entry.base_id().to_owned();
        let draft = drafts.entry(base_id).or_insert_with(|| Draft {
            display_name: entry.name.clone(),
            versions: BTreeMap::new(),
        });
        for (version, details) in &entry.versions {
            draft.versions.insert(
                version.clone(),
                VersionRow {
                    version: version.clone(),
                    installed: false,
                    published_date: details.published_date.clone(),
                    deprecated: entry.is_version_deprecated(version),
                    foxe: details.foxe.clone(),
                    is_latest: false,
                },
            );
        }
    }

    for info in installed {
        let base_id = extract_base_id(&info.id).to_owned();
        let draft = drafts.entry(base_id).or_insert_with(|| Draft {
            display_name: info
                .display_name
                .clone()
                .unwrap_or_else(|| info.qualified_name.clone()),
            versions: BTreeMap::new(),
        });
        draft
            .versions
            .entry(info.version.clone())
            .and_modify(|row| row.installed = true)
            .or_insert_with(|| VersionRow {
                version: info.version.clone(),
                installed: true,
                published_date: None,
                deprecated: false,
                foxe: None,
                is_latest: false,
            });
    }

    let mut groups: Vec<ExtensionGroup> = drafts
        .into_iter()
        .map(|(base_id, draft)| {
            let mut versions: Vec<VersionRow> = draft.versions.into_values().collect();
            versions.sort_by(|a, b| version_order(&a.version, &b.version));
            if let Some(latest) = versions.iter_mut().find(|v| !v.deprecated) {
                latest.is_latest = true;
            }
            ExtensionGroup {
                base_id,
                installed: versions.iter().any(|v| v.installed),
                display_name: draft.display_name,
                versions,
            }
        })
        .collect();
    groups.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.base_id.cmp(&b.base_id)));
    groups
}
