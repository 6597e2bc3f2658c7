//! Dedup boundary: the set of links already published to the queue.
//!
//! The producer keeps the set in memory and writes it out wholesale after
//! every cycle and on shutdown. A crash between a publish and the next save
//! can republish items on restart, so the boundary is at-least-once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::models::FeedItem;
use crate::storage::local::write_atomic;

/// In-memory set of processed links.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedLinks {
    links: HashSet<String>,
}

impl ProcessedLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, link: &str) -> bool {
        self.links.contains(link)
    }

    /// Returns `true` if the link was not present.
    pub fn insert(&mut self, link: impl Into<String>) -> bool {
        self.links.insert(link.into())
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Keep entries whose link is unseen, publishing each link once even
    /// when several feeds carry it.
    pub fn filter_new(&self, items: Vec<FeedItem>) -> Vec<FeedItem> {
        let mut batch_links = HashSet::new();
        items
            .into_iter()
            .filter(|item| !self.contains(&item.link) && batch_links.insert(item.link.clone()))
            .collect()
    }

    /// Links in sorted order, for stable files.
    pub fn sorted(&self) -> Vec<&str> {
        let mut links: Vec<&str> = self.links.iter().map(String::as_str).collect();
        links.sort_unstable();
        links
    }
}

impl FromIterator<String> for ProcessedLinks {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            links: iter.into_iter().collect(),
        }
    }
}

/// JSON file holding an array of link strings.
#[derive(Debug, Clone)]
pub struct DedupStore {
    path: PathBuf,
}

impl DedupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted set; an absent file is an empty set.
    ///
    /// A file that exists but does not parse is an error: starting from an
    /// empty set would republish everything.
    pub async fn load(&self) -> Result<ProcessedLinks> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "No dedup file at {}, starting empty",
                    self.path.display()
                );
                return Ok(ProcessedLinks::new());
            }
            Err(e) => return Err(AppError::Io(e)),
        };

        let links: Vec<String> = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::validation(format!(
                "dedup file {} is not a JSON array of strings: {}",
                self.path.display(),
                e
            ))
        })?;

        Ok(links.into_iter().collect())
    }

    /// Overwrite the persisted set.
    pub async fn save(&self, links: &ProcessedLinks) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&links.sorted())?;
        write_atomic(&self.path, &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn item(link: &str) -> FeedItem {
        FeedItem {
            title: Some(link.to_string()),
            summary: None,
            link: link.to_string(),
            published: None,
            source: "Test".to_string(),
        }
    }

    #[test]
    fn test_filter_new_drops_seen_links() {
        let seen: ProcessedLinks = ["https://a/1".to_string()].into_iter().collect();
        let fresh = seen.filter_new(vec![item("https://a/1"), item("https://a/2")]);

        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].link, "https://a/2");
    }

    #[test]
    fn test_filter_new_keeps_first_of_cross_posted_links() {
        let seen = ProcessedLinks::new();
        let mut second = item("https://a/1");
        second.source = "Mirror".to_string();

        let fresh = seen.filter_new(vec![item("https://a/1"), second, item("https://a/2")]);

        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].source, "Test");
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = DedupStore::new(tmp.path().join("processed_rss_links.json"));

        let links = store.load().await.unwrap();
        assert!(links.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let store = DedupStore::new(tmp.path().join("state/processed_rss_links.json"));

        let mut links = ProcessedLinks::new();
        links.insert("https://b/2");
        links.insert("https://a/1");
        store.save(&links).await.unwrap();

        let raw: Vec<String> =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw, vec!["https://a/1", "https://b/2"]);
        assert_eq!(store.load().await.unwrap(), links);
    }

    #[tokio::test]
    async fn test_load_rejects_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("processed_rss_links.json");
        std::fs::write(&path, b"{\"not\": \"a list\"}").unwrap();

        let err = DedupStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
