use async_trait::async_trait;
use std::path::PathBuf;
use uuid::Uuid;

use crate::models::Error;

/// A stored attachment file. Mails keep these references; the bytes live
/// behind the [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub id: Uuid,
    pub file_name: String,
    pub file_url: String,
    pub size: i64,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn save(&self, file_name: &str, content: &[u8], private: bool)
        -> Result<StoredFile, Error>;
}

/// Filesystem-backed store. Files land under `<root>/{public,private}/<id>/`
/// and are served from `<base_url>/files/...`.
pub struct LocalDocumentStore {
    root: PathBuf,
    base_url: String,
}

impl LocalDocumentStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn save(
        &self,
        file_name: &str,
        content: &[u8],
        private: bool,
    ) -> Result<StoredFile, Error> {
        let id = Uuid::now_v7();
        let visibility = if private { "private" } else { "public" };
        // strip any path components a hostile filename could smuggle in
        let safe_name = file_name
            .rsplit(['/', '\\'])
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("attachment")
            .to_owned();

        let dir = self.root.join(visibility).join(id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&safe_name), content).await?;

        Ok(StoredFile {
            id,
            file_url: format!("{}/files/{visibility}/{id}/{safe_name}", self.base_url),
            file_name: safe_name,
            size: content.len() as i64,
        })
    }
}

/// In-memory store for tests and ephemeral setups.
#[derive(Default)]
pub struct MemoryDocumentStore {
    files: tokio::sync::Mutex<Vec<(StoredFile, Vec<u8>)>>,
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn save(
        &self,
        file_name: &str,
        content: &[u8],
        _private: bool,
    ) -> Result<StoredFile, Error> {
        let id = Uuid::now_v7();
        let file = StoredFile {
            id,
            file_name: file_name.to_owned(),
            file_url: format!("memory://files/{id}/{file_name}"),
            size: content.len() as i64,
        };
        self.files
            .lock()
            .await
            .push((file.clone(), content.to_vec()));
        Ok(file)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn memory_store_assigns_urls() {
        let store = MemoryDocumentStore::default();
        let saved = store.save("report.pdf", b"%PDF-", true).await.unwrap();
        assert_eq!(saved.file_name, "report.pdf");
        assert_eq!(saved.size, 5);
        assert!(saved.file_url.contains(&saved.id.to_string()));
    }

    #[tokio::test]
    async fn local_store_strips_path_components() {
        let dir = std::env::temp_dir().join(format!("mailflow-store-{}", Uuid::now_v7()));
        let store = LocalDocumentStore::new(&dir, "http://localhost:8080");
        let saved = store
            .save("../../etc/passwd", b"nope", true)
            .await
            .unwrap();
        assert_eq!(saved.file_name, "passwd");
        assert!(saved.file_url.starts_with("http://localhost:8080/files/private/"));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
