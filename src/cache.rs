use std::collections::HashMap;

use crate::models::{EncodedImage, GenerationResult, Variant};

/// Heuristic fingerprint of a generation request.
///
/// Two images sharing their first `prefix_len` base64 characters map to the
/// same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    prompt: String,
    image_prefix: Option<String>,
    face_lock: bool,
}

impl CacheKey {
    pub fn derive(
        prompt_text: &str,
        image: Option<&EncodedImage>,
        face_lock: bool,
        prefix_len: usize,
    ) -> Self {
        let image_prefix = image.map(|image| image.data.chars().take(prefix_len).collect());
        Self {
            prompt: prompt_text.to_string(),
            face_lock: face_lock && image.is_some(),
            image_prefix,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEntry {
    pub preview: Option<GenerationResult>,
    pub final_result: Option<GenerationResult>,
}

impl CacheEntry {
    pub fn get(&self, variant: Variant) -> Option<&GenerationResult> {
        match variant {
            Variant::Preview => self.preview.as_ref(),
            Variant::Final => self.final_result.as_ref(),
        }
    }
}

/// Session-lifetime store of completed generations. Entries are never evicted.
#[derive(Debug, Default)]
pub struct SessionCache {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey, variant: Variant) -> Option<&GenerationResult> {
        self.entries.get(key).and_then(|entry| entry.get(variant))
    }

    pub fn entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Writes only the slot for `variant`; the other slot is left untouched.
    pub fn store(&mut self, key: CacheKey, variant: Variant, result: GenerationResult) {
        let entry = self.entries.entry(key).or_default();
        match variant {
            Variant::Preview => entry.preview = Some(result),
            Variant::Final => entry.final_result = Some(result),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
