//! Cookie persistence for Google Scholar requests.
//!
//! Cookies exported from a real browser session are kept in a JSON file. The
//! file seeds a shared `reqwest` cookie jar at startup; the jar handles
//! `Set-Cookie` during requests and is written back once when a session or the
//! server ends, so a refreshed session survives restarts.

use crate::config::ScholarConfig;
use crate::error::{PubfillError, Result};
use reqwest::cookie::{CookieStore, Jar};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

/// Default cookie file path: `~/.gscholar_cookies.json`
fn default_cookie_path() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|p| p.join(".gscholar_cookies.json"))
        .ok_or_else(|| PubfillError::Config("Cannot determine home directory".to_string()))
}

/// Cookie entry in browser-export format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub expires: Option<f64>,
}

impl Cookie {
    fn host(&self) -> &str {
        self.domain.trim_start_matches('.')
    }

    /// `Set-Cookie` form accepted by the jar.
    fn to_set_cookie(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        let mut header = format!(
            "{}={}; Domain={}; Path={}",
            self.name,
            self.value,
            self.host(),
            path
        );
        if self.secure {
            header.push_str("; Secure");
        }
        if self.http_only {
            header.push_str("; HttpOnly");
        }
        header
    }

    fn matches_host(&self, host: &str) -> bool {
        let own = self.host();
        host == own || host.ends_with(&format!(".{}", own))
    }
}

/// Loads and saves the cookie file. Clones share one write lock.
#[derive(Debug, Clone)]
pub struct CookieManager {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl CookieManager {
    /// Cookie file from config, else the home-directory default.
    pub fn from_config(config: &ScholarConfig) -> Self {
        let path = config
            .cookie_path
            .clone()
            .or_else(|| default_cookie_path().ok())
            .unwrap_or_else(|| PathBuf::from(".gscholar_cookies.json"));
        Self::with_path(path)
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Empty when the file is missing or unreadable.
    pub fn load(&self) -> Vec<Cookie> {
        if !self.path.exists() {
            debug!("Cookie file not found: {:?}", self.path);
            return Vec::new();
        }

        match std::fs::read_to_string(&self.path) {
            Ok(content) => parse_cookies(&content),
            Err(e) => {
                warn!("Failed to read cookie file: {}", e);
                Vec::new()
            }
        }
    }

    pub fn save(&self, cookies: &[Cookie]) -> Result<()> {
        let content = serde_json::to_string_pretty(cookies)?;
        std::fs::write(&self.path, content)?;
        debug!("Saved {} cookies to {:?}", cookies.len(), self.path);
        Ok(())
    }

    /// Add the stored cookies to `jar`; returns how many were accepted.
    pub fn seed(&self, jar: &Jar) -> usize {
        let mut seeded = 0;
        for cookie in self.load() {
            match Url::parse(&format!("https://{}/", cookie.host())) {
                Ok(url) => {
                    jar.add_cookie_str(&cookie.to_set_cookie(), &url);
                    seeded += 1;
                }
                Err(e) => debug!(domain = %cookie.domain, error = %e, "Skipping cookie"),
            }
        }
        seeded
    }

    /// Merge what `jar` holds for `urls` into the file.
    ///
    /// Read, merge and write happen under the shared lock, so concurrent
    /// callers never drop each other's cookies.
    pub async fn persist(&self, jar: &Jar, urls: &[Url]) -> Result<usize> {
        let _guard = self.lock.lock().await;

        let mut cookies = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => parse_cookies(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut updated = 0;
        for url in urls {
            let Some(host) = url.host_str() else { continue };
            let Some(header) = jar.cookies(url) else { continue };
            let Ok(header) = header.to_str() else { continue };

            for (name, value) in header.split("; ").filter_map(|pair| pair.split_once('=')) {
                match cookies
                    .iter_mut()
                    .find(|c| c.name == name && c.matches_host(host))
                {
                    Some(existing) if existing.value == value => continue,
                    Some(existing) => existing.value = value.to_string(),
                    None => cookies.push(Cookie {
                        name: name.to_string(),
                        value: value.to_string(),
                        domain: format!(".{}", host),
                        path: "/".to_string(),
                        secure: url.scheme() == "https",
                        http_only: false,
                        expires: None,
                    }),
                }
                updated += 1;
            }
        }

        if updated > 0 {
            let content = serde_json::to_string_pretty(&cookies)?;
            let tmp = self.path.with_extension("json.tmp");
            tokio::fs::write(&tmp, content).await?;
            tokio::fs::rename(&tmp, &self.path).await?;
            debug!(updated, total = cookies.len(), "Persisted cookies to {:?}", self.path);
        }
        Ok(updated)
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            info!("Cleared cookies at {:?}", self.path);
        }
        Ok(())
    }
}

fn parse_cookies(content: &str) -> Vec<Cookie> {
    serde_json::from_str::<Vec<Cookie>>(content).unwrap_or_else(|e| {
        warn!("Failed to parse cookies: {}", e);
        Vec::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn cookie(name: &str, value: &str, domain: &str) -> Cookie {
        Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: "/".to_string(),
            secure: true,
            http_only: false,
            expires: None,
        }
    }

    fn scholar() -> Url {
        Url::parse("https://scholar.google.com/").expect("valid url")
    }

    #[test]
    fn test_load_missing_file() {
        let manager = CookieManager::with_path(PathBuf::from("/nonexistent/path"));
        assert!(manager.load().is_empty());
        assert_eq!(manager.seed(&Jar::default()), 0);
    }

    #[test]
    fn test_seed_sends_matching_domains() -> Result<()> {
        let temp = NamedTempFile::new()?;
        let manager = CookieManager::with_path(temp.path().to_path_buf());
        manager.save(&[
            cookie("GSP", "a", ".scholar.google.com"),
            cookie("NID", "b", ".google.com"),
            cookie("other", "c", ".example.com"),
        ])?;

        let jar = Jar::default();
        assert_eq!(manager.seed(&jar), 3);
        let header = jar.cookies(&scholar()).expect("cookies for scholar");
        let header = header.to_str().expect("ascii header");
        assert!(header.contains("GSP=a"));
        assert!(header.contains("NID=b"));
        assert!(!header.contains("other=c"));
        Ok(())
    }

    #[tokio::test]
    async fn test_persist_updates_and_appends() -> Result<()> {
        let temp = NamedTempFile::new()?;
        let manager = CookieManager::with_path(temp.path().to_path_buf());
        manager.save(&[cookie("NID", "old", ".google.com")])?;

        let jar = Jar::default();
        manager.seed(&jar);
        jar.add_cookie_str("NID=new; Domain=google.com; Path=/", &scholar());
        jar.add_cookie_str("GSP=x; Path=/; Secure", &scholar());

        assert_eq!(manager.persist(&jar, &[scholar()]).await?, 2);
        let loaded = manager.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "NID");
        assert_eq!(loaded[0].value, "new");
        assert_eq!(loaded[1].name, "GSP");
        assert_eq!(loaded[1].domain, ".scholar.google.com");
        assert!(loaded[1].secure);
        Ok(())
    }

    #[tokio::test]
    async fn test_persist_unchanged_jar_writes_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = CookieManager::with_path(dir.path().join("cookies.json"));
        assert_eq!(manager.persist(&Jar::default(), &[scholar()]).await?, 0);
        assert!(!manager.path().exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_persist_keeps_every_cookie() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = CookieManager::with_path(dir.path().join("cookies.json"));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let manager = manager.clone();
            tasks.spawn(async move {
                let jar = Jar::default();
                jar.add_cookie_str(&format!("C{}=v{}; Path=/", i, i), &scholar());
                manager.persist(&jar, &[scholar()]).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            assert_eq!(joined.expect("task completes")?, 1);
        }

        let loaded = manager.load();
        assert_eq!(loaded.len(), 32);
        for i in 0..32 {
            let name = format!("C{}", i);
            let found = loaded.iter().find(|c| c.name == name).expect("cookie kept");
            assert_eq!(found.value, format!("v{}", i));
        }
        Ok(())
    }

    #[test]
    fn test_clear_removes_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = CookieManager::with_path(dir.path().join("cookies.json"));
        manager.save(&[cookie("a", "b", ".google.com")])?;
        manager.clear()?;
        assert!(!manager.path().exists());
        Ok(())
    }
}
