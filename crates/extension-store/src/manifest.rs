//! `.foxe` package parsing.
//!
//! A `.foxe` asset is a zip archive carrying a `package.json` manifest and
//! optional `README.md` / `CHANGELOG.md` documents. The archive bytes are
//! stored verbatim; only the manifest and docs are extracted at install
//! time.

use std::io::{Cursor, Read};

use serde::Deserialize;

use crate::StoreError;

#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionManifest {
    pub name: String,
    pub publisher: String,
    pub version: String,
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// The parsed pieces of a `.foxe` buffer.
#[derive(Debug, Clone)]
pub struct FoxePackage {
    pub manifest: ExtensionManifest,
    pub readme: Option<String>,
    pub changelog: Option<String>,
}

impl FoxePackage {
    pub fn base_id(&self) -> String {
        format!("{}.{}", self.manifest.publisher, self.manifest.name)
    }

    pub fn qualified_name(&self) -> String {
        self.base_id()
    }
}

fn read_entry(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> Option<String> {
    let mut file = archive.by_name(name).ok()?;
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    Some(content)
}

/// Parse a `.foxe` buffer, validating the manifest identity fields.
pub fn parse_foxe(bytes: &[u8]) -> Result<FoxePackage, StoreError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| StoreError::Parse(format!("not a valid extension archive: {e}")))?;

    let manifest_text = read_entry(&mut archive, "package.json")
        .ok_or_else(|| StoreError::Parse("extension archive has no package.json".to_owned()))?;
    let manifest: ExtensionManifest = serde_json::from_str(&manifest_text)
        .map_err(|e| StoreError::Parse(format!("invalid package.json: {e}")))?;

    if manifest.publisher.trim().is_empty() {
        return Err(StoreError::Parse("manifest has an empty publisher".to_owned()));
    }
    if manifest.name.trim().is_empty() {
        return Err(StoreError::Parse("manifest has an empty name".to_owned()));
    }
    if manifest.version.trim().is_empty() {
        return Err(StoreError::Parse("manifest has an empty version".to_owned()));
    }

    let readme = read_entry(&mut archive, "README.md");
    let changelog = read_entry(&mut archive, "CHANGELOG.md");
    Ok(FoxePackage {
        manifest,
        readme,
        changelog,
    })
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use std::io::Write;

    /// Build a minimal `.foxe` buffer for tests.
    pub fn foxe_bytes(publisher: &str, name: &str, version: &str, readme: Option<&str>) -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buffer));
            let options: zip::write::SimpleFileOptions = Default::default();
            writer.start_file("package.json", options).unwrap();
            writer
                .write_all(
                    serde_json::json!({
                        "publisher": publisher,
                        "name": name,
                        "version": version,
                        "displayName": format!("{name} panel"),
                        "description": "test extension",
                    })
                    .to_string()
                    .as_bytes(),
                )
                .unwrap();
            if let Some(readme) = readme {
                writer.start_file("README.md", options).unwrap();
                writer.write_all(readme.as_bytes()).unwrap();
            }
            writer.start_file("dist/extension.js", options).unwrap();
            writer.write_all(b"module.exports = {};").unwrap();
            writer.finish().unwrap();
        }
        buffer
    }
}
