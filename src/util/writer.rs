use std::path::{Path, PathBuf};

use serde_json::{Map, Value, json};
use tokio::fs;

use crate::{
    direct_link::FetchedThumbnail,
    errors::ExportError,
    export::ExportedThumbnail,
    models::Variant,
    util::{local_rfc3339, now_local},
};

#[derive(Debug, Clone)]
pub struct SavedFile {
    pub image_path: PathBuf,
    pub meta_path: PathBuf,
}

/// Writes downloads into one directory, each with a `<name>.meta.json`
/// sidecar next to it. Existing files of the same name are overwritten.
pub struct DownloadWriter {
    root: PathBuf,
}

impl DownloadWriter {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub async fn save_thumbnail(
        &self,
        exported: &ExportedThumbnail,
        prompt_text: &str,
        variant: Variant,
        face_lock: bool,
    ) -> Result<SavedFile, ExportError> {
        let mut meta = Map::new();
        meta.insert("prompt".to_string(), json!(prompt_text));
        meta.insert("variant".to_string(), json!(variant));
        meta.insert("face_lock".to_string(), json!(face_lock));
        self.persist(&exported.file_name, &exported.bytes, meta).await
    }

    pub async fn save_fetched(&self, fetched: &FetchedThumbnail) -> Result<SavedFile, ExportError> {
        let mut meta = Map::new();
        meta.insert("video_id".to_string(), json!(fetched.video_id.as_str()));
        meta.insert("source_url".to_string(), json!(fetched.url));
        self.persist(&fetched.file_name, &fetched.bytes, meta).await
    }

    async fn persist(
        &self,
        file_name: &str,
        bytes: &[u8],
        mut meta: Map<String, Value>,
    ) -> Result<SavedFile, ExportError> {
        fs::create_dir_all(&self.root).await?;

        let image_path = self.root.join(file_name);
        fs::write(&image_path, bytes).await?;

        let stem = Path::new(file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(file_name);
        meta.insert("file".to_string(), json!(file_name));
        meta.insert("created_at".to_string(), json!(local_rfc3339(&now_local())));

        let meta_path = self.root.join(format!("{stem}.meta.json"));
        let encoded = serde_json::to_vec_pretty(&Value::Object(meta))
            .map_err(|err| ExportError::EncodeFailed(err.to_string()))?;
        fs::write(&meta_path, encoded).await?;

        Ok(SavedFile {
            image_path,
            meta_path,
        })
    }
}
