//! Snapshot sources.
//!
//! A [`SnapshotSource`] exposes a cheap change feed ([`latest_version`]) and
//! a bulk download. Two implementations:
//!
//! - [`GeonorgeSource`]: the Geonorge ATOM feed over HTTP. The nationwide
//!   entry ("Landsdekkende" or a `_0000_` area code) for the configured
//!   format is selected; when several match, the newest `updated` wins and
//!   its `updated` value is the version marker.
//! - [`DirectorySource`]: a local directory with `snapshot.geojson` or
//!   `snapshot.zip`, an optional `VERSION` file, and an optional
//!   `snapshot.sha256` sidecar. Used for offline runs and tests.
//!
//! [`latest_version`]: SnapshotSource::latest_version

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::SourceConfig;
use crate::fetch::FetchError;
use crate::geometry::{parse_epsg, GEOGRAPHIC_EPSG};
use crate::release::sha256_hex;

/// One raw download before checksum verification.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,
    /// Raw checksum text as published, if the source publishes one.
    pub checksum: Option<String>,
    pub version: String,
    pub url: String,
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Human-readable identity for logs and reports.
    fn describe(&self) -> String;

    /// Version marker of the newest available snapshot, without downloading it.
    async fn latest_version(&self) -> Result<String, FetchError>;

    async fn download(&self) -> Result<Download, FetchError>;
}

pub fn source_from_config(config: &SourceConfig) -> anyhow::Result<Box<dyn SnapshotSource>> {
    match config.kind.as_str() {
        "geonorge" => Ok(Box::new(GeonorgeSource::new(config)?)),
        "directory" => {
            let dir = config
                .dir
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("source.dir required for directory source"))?;
            Ok(Box::new(DirectorySource::new(dir)))
        }
        other => anyhow::bail!("Unknown source kind: {}", other),
    }
}

// ============ Geonorge ATOM ============

#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub title: String,
    pub updated: String,
    pub links: Vec<String>,
    /// `<category term>` values; Geonorge lists the projection here.
    pub categories: Vec<String>,
}

pub struct GeonorgeSource {
    client: reqwest::Client,
    feed_url: String,
    format_tag: String,
    checksum_suffix: Option<String>,
}

impl GeonorgeSource {
    pub fn new(config: &SourceConfig) -> anyhow::Result<Self> {
        let feed_url = config
            .feed_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("source.feed_url required for geonorge source"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("trailforge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            feed_url,
            format_tag: config.format_tag.clone(),
            checksum_suffix: config.checksum_suffix.clone(),
        })
    }

    async fn selected_entry(&self) -> Result<(FeedEntry, String), FetchError> {
        let body = self.get(&self.feed_url).await?;
        let entries = parse_feed(&body)?;
        if entries.is_empty() {
            return Err(FetchError::fatal("no entries found in ATOM feed"));
        }
        select_entry(&entries, &self.format_tag).ok_or_else(|| {
            FetchError::fatal(format!(
                "no nationwide {} download in ATOM feed ({} entries)",
                self.format_tag,
                entries.len()
            ))
        })
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::retryable(format!("GET {}: {}", url, e)))
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.send(url).await?;
        body(url, response).await
    }

    async fn checksum(&self, url: &str) -> Result<Option<String>, FetchError> {
        let Some(suffix) = &self.checksum_suffix else {
            return Ok(None);
        };
        let sidecar = format!("{}{}", url, suffix);
        let response = self.send(&sidecar).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(url = %sidecar, "no checksum published");
            return Ok(None);
        }
        let bytes = body(&sidecar, response).await?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Status classification: 429/5xx and transport errors retry, other
/// non-success statuses do not.
async fn body(url: &str, response: reqwest::Response) -> Result<Vec<u8>, FetchError> {
    let status = response.status();
    if !status.is_success() {
        let message = format!("GET {}: HTTP {}", url, status);
        return if status.as_u16() == 429 || status.is_server_error() {
            Err(FetchError::retryable(message))
        } else {
            Err(FetchError::fatal(message))
        };
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| FetchError::retryable(format!("GET {}: {}", url, e)))?;
    Ok(bytes.to_vec())
}

#[async_trait]
impl SnapshotSource for GeonorgeSource {
    fn describe(&self) -> String {
        format!("geonorge:{}", self.feed_url)
    }

    async fn latest_version(&self) -> Result<String, FetchError> {
        let (entry, _) = self.selected_entry().await?;
        Ok(entry.updated)
    }

    async fn download(&self) -> Result<Download, FetchError> {
        let (entry, url) = self.selected_entry().await?;
        tracing::info!(url = %url, title = %entry.title, updated = %entry.updated, "downloading snapshot");
        let bytes = self.get(&url).await?;
        let checksum = self.checksum(&url).await?;
        Ok(Download {
            bytes,
            checksum,
            version: entry.updated,
            url,
        })
    }
}

/// Parse ATOM `<entry>` elements. Malformed XML is not retryable.
pub fn parse_feed(xml: &[u8]) -> Result<Vec<FeedEntry>, FetchError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut entries = Vec::new();
    let mut current: Option<FeedEntry> = None;
    let mut field: Option<&'static str> = None;
    let mut saw_feed = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"feed" => saw_feed = true,
                b"entry" => {
                    current = Some(FeedEntry {
                        title: String::new(),
                        updated: String::new(),
                        links: Vec::new(),
                        categories: Vec::new(),
                    })
                }
                b"title" if current.is_some() => field = Some("title"),
                b"updated" if current.is_some() => field = Some("updated"),
                b"link" => push_attr(&mut current, &e, b"href"),
                b"category" => push_attr(&mut current, &e, b"term"),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"link" => push_attr(&mut current, &e, b"href"),
                b"category" => push_attr(&mut current, &e, b"term"),
                _ => {}
            },
            Ok(Event::Text(te)) => {
                if let (Some(entry), Some(name)) = (current.as_mut(), field) {
                    let text = te.unescape().unwrap_or_default();
                    match name {
                        "title" => entry.title.push_str(&text),
                        _ => entry.updated.push_str(&text),
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"entry" => entries.extend(current.take()),
                b"title" | b"updated" => field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(FetchError::fatal(format!("malformed ATOM feed: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    if !saw_feed {
        return Err(FetchError::fatal("malformed ATOM feed: no <feed> element"));
    }
    Ok(entries)
}

fn push_attr(current: &mut Option<FeedEntry>, e: &quick_xml::events::BytesStart<'_>, key: &[u8]) {
    let Some(entry) = current.as_mut() else {
        return;
    };
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == key {
            if let Ok(v) = attr.unescape_value() {
                let target = if key == b"href" {
                    &mut entry.links
                } else {
                    &mut entry.categories
                };
                target.push(v.into_owned());
            }
        }
    }
}

/// The newest nationwide entry for `format_tag` and its download link.
///
/// Links in a projected CRS (Geonorge also publishes UTM zones) are never
/// selected. On equal `updated`, a link naming the format wins, then one
/// that declares a geographic CRS over one that declares none.
pub fn select_entry(entries: &[FeedEntry], format_tag: &str) -> Option<(FeedEntry, String)> {
    let tag = format_tag.to_lowercase();
    entries
        .iter()
        .filter(|e| e.title.contains("Landsdekkende") || e.title.contains("_0000_"))
        .filter(|e| e.title.to_lowercase().contains(&tag))
        .flat_map(|e| {
            e.links
                .iter()
                .filter(|l| {
                    let l = l.to_lowercase();
                    l.ends_with(".zip") || l.ends_with(".json") || l.ends_with(".geojson")
                })
                .map(move |l| (e, l))
        })
        .filter_map(|(e, l)| {
            let epsg = link_epsg(l).or_else(|| entry_epsg(e));
            match epsg {
                Some(code) if !GEOGRAPHIC_EPSG.contains(&code) => {
                    tracing::debug!(url = %l, epsg = code, "skipping projected download");
                    None
                }
                _ => Some((e, l, l.to_lowercase().contains(&tag), epsg.is_some())),
            }
        })
        .max_by(|a, b| {
            a.0.updated
                .cmp(&b.0.updated)
                .then(a.2.cmp(&b.2))
                .then(a.3.cmp(&b.3))
        })
        .map(|(e, l, ..)| (e.clone(), l.clone()))
}

fn entry_epsg(entry: &FeedEntry) -> Option<u32> {
    entry
        .categories
        .iter()
        .find_map(|c| parse_epsg(c))
        .or_else(|| parse_epsg(&entry.title))
}

/// Geonorge file names carry the code as a bare token:
/// `Friluftsliv_0000_Norge_25833_TurOgFriluftsruter_GeoJSON.zip`.
fn link_epsg(link: &str) -> Option<u32> {
    let name = link.rsplit('/').next().unwrap_or(link);
    parse_epsg(name).or_else(|| {
        name.split(|c: char| c == '_' || c == '.')
            .filter(|t| (4..=5).contains(&t.len()) && t.chars().all(|c| c.is_ascii_digit()))
            .filter_map(|t| t.parse::<u32>().ok())
            .find(|code| (2000..=32767).contains(code))
    })
}

// ============ Directory ============

pub const DIR_GEOJSON: &str = "snapshot.geojson";
pub const DIR_ZIP: &str = "snapshot.zip";
pub const DIR_VERSION: &str = "VERSION";
pub const DIR_CHECKSUM: &str = "snapshot.sha256";

pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn payload_path(&self) -> Result<PathBuf, FetchError> {
        [DIR_GEOJSON, DIR_ZIP]
            .iter()
            .map(|name| self.dir.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                FetchError::fatal(format!(
                    "no {} or {} in {}",
                    DIR_GEOJSON,
                    DIR_ZIP,
                    self.dir.display()
                ))
            })
    }

    fn read(path: &Path) -> Result<Vec<u8>, FetchError> {
        std::fs::read(path)
            .map_err(|e| FetchError::retryable(format!("read {}: {}", path.display(), e)))
    }

    fn version_for(&self, payload: Option<&[u8]>) -> Result<String, FetchError> {
        let version_path = self.dir.join(DIR_VERSION);
        if version_path.is_file() {
            let text = String::from_utf8_lossy(&Self::read(&version_path)?)
                .trim()
                .to_string();
            if !text.is_empty() {
                return Ok(text);
            }
        }
        match payload {
            Some(bytes) => Ok(sha256_hex(bytes)),
            None => Ok(sha256_hex(&Self::read(&self.payload_path()?)?)),
        }
    }
}

#[async_trait]
impl SnapshotSource for DirectorySource {
    fn describe(&self) -> String {
        format!("directory:{}", self.dir.display())
    }

    async fn latest_version(&self) -> Result<String, FetchError> {
        self.version_for(None)
    }

    async fn download(&self) -> Result<Download, FetchError> {
        let path = self.payload_path()?;
        let bytes = Self::read(&path)?;
        let checksum_path = self.dir.join(DIR_CHECKSUM);
        let checksum = if checksum_path.is_file() {
            Some(String::from_utf8_lossy(&Self::read(&checksum_path)?).into_owned())
        } else {
            None
        };
        Ok(Download {
            version: self.version_for(Some(&bytes))?,
            bytes,
            checksum,
            url: format!("file://{}", path.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
    <title>Turrutebasen</title>
    <entry>
        <title>GeoJSON-format, Landsdekkende</title>
        <link rel="alternate" href="https://example.com/Friluftsliv_0000_Norge_4326_TurOgFriluftsruter_GeoJSON.zip"/>
        <updated>2025-09-17T05:31:27</updated>
    </entry>
    <entry>
        <title>GeoJSON-format, Landsdekkende</title>
        <link rel="alternate" href="https://example.com/new_GeoJSON.zip"/>
        <updated>2025-09-18T05:31:27</updated>
    </entry>
    <entry>
        <title>FGDB-format, Landsdekkende</title>
        <link rel="alternate" href="https://example.com/newest_FGDB.zip"/>
        <updated>2025-09-19T05:31:27</updated>
    </entry>
    <entry>
        <title>GeoJSON-format, Oslo</title>
        <link href="https://example.com/Friluftsliv_0301_Oslo_GeoJSON.zip"/>
        <updated>2025-09-20T05:31:27</updated>
    </entry>
</feed>"#;

    #[test]
    fn parses_entries_with_links() {
        let entries = parse_feed(FEED.as_bytes()).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].title, "GeoJSON-format, Landsdekkende");
        assert_eq!(entries[0].updated, "2025-09-17T05:31:27");
        assert_eq!(entries[0].links.len(), 1);
    }

    #[test]
    fn selects_newest_nationwide_entry_for_format() {
        let entries = parse_feed(FEED.as_bytes()).unwrap();
        let (entry, url) = select_entry(&entries, "GeoJSON").unwrap();
        assert_eq!(entry.updated, "2025-09-18T05:31:27");
        assert_eq!(url, "https://example.com/new_GeoJSON.zip");

        let (fgdb, _) = select_entry(&entries, "FGDB").unwrap();
        assert_eq!(fgdb.updated, "2025-09-19T05:31:27");
    }

    #[test]
    fn no_nationwide_entry_selects_nothing() {
        let entries = parse_feed(FEED.as_bytes()).unwrap();
        assert!(select_entry(&entries[3..], "GeoJSON").is_none());
        assert!(select_entry(&entries, "SOSI").is_none());
    }

    const PROJECTIONS: &str = r#"<feed xmlns="http://www.w3.org/2005/Atom">
    <entry>
        <title>GeoJSON-format, Landsdekkende, UTM 33</title>
        <category term="EPSG:25833" label="EUREF89 UTM sone 33"/>
        <link href="https://example.com/Friluftsliv_0000_Norge_25833_TurOgFriluftsruter_GeoJSON.zip"/>
        <updated>2025-09-18T05:31:27</updated>
    </entry>
    <entry>
        <title>GeoJSON-format, Landsdekkende, geografisk</title>
        <category term="EPSG:4326" label="WGS 84 geografisk"/>
        <link href="https://example.com/Friluftsliv_0000_Norge_4326_TurOgFriluftsruter_GeoJSON.zip"/>
        <updated>2025-09-18T05:31:27</updated>
    </entry>
</feed>"#;

    #[test]
    fn projected_downloads_are_never_selected() {
        let entries = parse_feed(PROJECTIONS.as_bytes()).unwrap();
        assert_eq!(entries[0].categories, vec!["EPSG:25833".to_string()]);

        let (entry, url) = select_entry(&entries, "GeoJSON").unwrap();
        assert_eq!(entry.categories, vec!["EPSG:4326".to_string()]);
        assert!(url.contains("_4326_"));

        assert!(select_entry(&entries[..1], "GeoJSON").is_none());
    }

    #[test]
    fn epsg_codes_from_file_names() {
        assert_eq!(link_epsg("https://x/Friluftsliv_0301_Oslo_25832_GeoJSON.zip"), Some(25832));
        assert_eq!(link_epsg("https://x/Friluftsliv_0301_Oslo_GeoJSON.zip"), None);
    }

    #[test]
    fn malformed_feed_is_not_retryable() {
        let err = parse_feed(b"not valid xml <>").unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn directory_source_uses_version_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(DIR_GEOJSON), b"{}").unwrap();
        std::fs::write(dir.path().join(DIR_VERSION), b"2025-01-01\n").unwrap();
        let source = DirectorySource::new(dir.path());
        assert_eq!(source.latest_version().await.unwrap(), "2025-01-01");

        let download = source.download().await.unwrap();
        assert_eq!(download.version, "2025-01-01");
        assert_eq!(download.bytes, b"{}");
        assert!(download.checksum.is_none());
        assert!(download.url.starts_with("file://"));
    }

    #[tokio::test]
    async fn directory_source_falls_back_to_payload_digest() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(DIR_ZIP), b"PK\x03\x04rest").unwrap();
        std::fs::write(dir.path().join(DIR_CHECKSUM), b"abc  snapshot.zip\n").unwrap();
        let source = DirectorySource::new(dir.path());
        let download = source.download().await.unwrap();
        assert_eq!(download.version, sha256_hex(b"PK\x03\x04rest"));
        assert_eq!(download.checksum.as_deref(), Some("abc  snapshot.zip\n"));
    }

    #[tokio::test]
    async fn empty_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = DirectorySource::new(dir.path()).download().await.unwrap_err();
        assert!(!err.retryable);
    }
}
