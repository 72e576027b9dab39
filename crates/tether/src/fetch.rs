//! Source fetch: URL → text.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::FetchError;

#[async_trait]
pub trait SourceFetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// Reads `file://` URLs and plain paths, relative to an optional base
/// directory.
#[derive(Debug, Clone, Default)]
pub struct FileFetch {
    base: Option<PathBuf>,
}

impl FileFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Some(base.into()),
        }
    }

    fn resolve(&self, url: &str) -> Result<PathBuf, FetchError> {
        let path = match url.split_once("://") {
            Some(("file", rest)) => PathBuf::from(rest),
            Some((scheme, _)) => return Err(FetchError::UnsupportedScheme(scheme.to_string())),
            None => PathBuf::from(url),
        };
        Ok(match &self.base {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        })
    }
}

#[async_trait]
impl SourceFetch for FileFetch {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let path = self.resolve(url)?;
        tracing::debug!("[fetch] reading {}", path.display());
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| FetchError::Unavailable {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Where a worker's source code comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Inline(String),
    Url(String),
}

impl SourceRef {
    pub fn inline(code: impl Into<String>) -> Self {
        SourceRef::Inline(code.into())
    }

    pub fn url(url: impl Into<String>) -> Self {
        SourceRef::Url(url.into())
    }

    /// Label used in run descriptors and logs.
    pub fn label(&self) -> &str {
        match self {
            SourceRef::Inline(_) => "<inline>",
            SourceRef::Url(url) => url,
        }
    }

    pub async fn load(&self, fetch: &dyn SourceFetch) -> Result<String, FetchError> {
        match self {
            SourceRef::Inline(code) => Ok(code.clone()),
            SourceRef::Url(url) => fetch.fetch(url).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_fetch_paths_and_urls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.sh"), "print hi\n").unwrap();

        let fetch = FileFetch::with_base(dir.path());
        assert_eq!(fetch.fetch("main.sh").await.unwrap(), "print hi\n");

        let absolute = format!("file://{}", dir.path().join("main.sh").display());
        assert_eq!(FileFetch::new().fetch(&absolute).await.unwrap(), "print hi\n");
    }

    #[tokio::test]
    async fn test_fetch_failures_are_typed() {
        let fetch = FileFetch::new();
        assert!(matches!(
            fetch.fetch("/definitely/not/here.sh").await,
            Err(FetchError::Unavailable { .. })
        ));
        assert!(matches!(
            fetch.fetch("https://example.com/main.sh").await,
            Err(FetchError::UnsupportedScheme(s)) if s == "https"
        ));
    }

    #[tokio::test]
    async fn test_source_ref_load() {
        let inline = SourceRef::inline("print x");
        assert_eq!(inline.label(), "<inline>");
        assert_eq!(inline.load(&FileFetch::new()).await.unwrap(), "print x");
    }
}
