use std::{fmt, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client as HttpClient, header::CONTENT_LENGTH};
use tracing::{debug, info};

use crate::errors::DirectLinkError;

pub const VIDEO_ID_LEN: usize = 11;

/// Thumbnail variants published for every video, best first.
pub const CANDIDATE_FILES: [&str; 3] = ["maxresdefault.jpg", "sddefault.jpg", "hqdefault.jpg"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoId(String);

impl VideoId {
    /// Finds the rightmost classic URL marker (falling back to `shorts/` and
    /// `live/`) and takes the run of characters after it up to `#`, `&` or
    /// `?`. The run must be exactly 11 of `[A-Za-z0-9_-]`.
    pub fn extract(link: &str) -> Result<Self, DirectLinkError> {
        let chars: Vec<char> = link.trim().chars().collect();

        let rightmost = |markers: fn(&[char], usize) -> Option<usize>| {
            (0..=chars.len()).rev().find_map(|pos| markers(&chars, pos))
        };
        let start = rightmost(classic_marker_end)
            .or_else(|| rightmost(path_marker_end))
            .ok_or(DirectLinkError::InvalidLink)?;

        let id: String = chars[start..]
            .iter()
            .take_while(|ch| !matches!(ch, '#' | '&' | '?'))
            .collect();

        let valid = id.chars().count() == VIDEO_ID_LEN
            && id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'));
        if valid {
            Ok(Self(id))
        } else {
            Err(DirectLinkError::InvalidLink)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn literal_end(chars: &[char], pos: usize, marker: &str) -> Option<usize> {
    let marker: Vec<char> = marker.chars().collect();
    chars[pos..].starts_with(&marker).then(|| pos + marker.len())
}

/// Index just past the first classic marker matching at `pos`, if any.
fn classic_marker_end(chars: &[char], pos: usize) -> Option<usize> {
    let rest = &chars[pos..];

    // youtu.be/ where the dot matches any character
    if rest.len() >= 9
        && rest[..5] == ['y', 'o', 'u', 't', 'u']
        && rest[6..9] == ['b', 'e', '/']
    {
        return Some(pos + 9);
    }
    if let Some(end) = literal_end(chars, pos, "v/") {
        return Some(end);
    }
    // u/<word char>/
    if rest.len() >= 4
        && rest[0] == 'u'
        && rest[1] == '/'
        && (rest[2].is_ascii_alphanumeric() || rest[2] == '_')
        && rest[3] == '/'
    {
        return Some(pos + 4);
    }
    ["embed/", "watch?v=", "&v="]
        .into_iter()
        .find_map(|marker| literal_end(chars, pos, marker))
}

fn path_marker_end(chars: &[char], pos: usize) -> Option<usize> {
    ["shorts/", "live/"]
        .into_iter()
        .find_map(|marker| literal_end(chars, pos, marker))
}

pub fn candidate_urls(thumbnail_base: &str, id: &VideoId) -> Vec<String> {
    CANDIDATE_FILES
        .iter()
        .map(|file| format!("{thumbnail_base}/{id}/{file}"))
        .collect()
}

/// Existence probe plus full download for a candidate URL.
#[async_trait]
pub trait ThumbnailSource: Send + Sync {
    /// `true` when the resource exists and is not empty. Transport errors
    /// count as missing.
    async fn exists(&self, url: &str) -> bool;

    async fn fetch(&self, url: &str) -> Result<Bytes, String>;
}

pub struct HttpThumbnailSource {
    http: HttpClient,
}

impl HttpThumbnailSource {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = HttpClient::builder()
            .user_agent(concat!("thumbnail-maker/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ThumbnailSource for HttpThumbnailSource {
    async fn exists(&self, url: &str) -> bool {
        match self.http.head(url).send().await {
            Ok(response) => {
                let non_empty = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .map(|value| value.as_bytes() != b"0")
                    .unwrap_or(true);
                response.status().is_success() && non_empty
            }
            Err(err) => {
                debug!(target: "direct_link", %url, error = %err, "probe failed");
                false
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<Bytes, String> {
        let response = self.http.get(url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }
        response.bytes().await.map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct FetchedThumbnail {
    pub video_id: VideoId,
    pub url: String,
    pub file_name: String,
    pub bytes: Bytes,
}

pub struct DirectLinkFetcher<S> {
    source: S,
    thumbnail_base: String,
}

impl<S: ThumbnailSource> DirectLinkFetcher<S> {
    pub fn new(source: S, thumbnail_base: impl Into<String>) -> Self {
        Self {
            source,
            thumbnail_base: thumbnail_base.into(),
        }
    }

    /// Probes candidates in order and returns the first that exists.
    pub async fn find_candidate(&self, id: &VideoId) -> Result<String, DirectLinkError> {
        for url in candidate_urls(&self.thumbnail_base, id) {
            if self.source.exists(&url).await {
                return Ok(url);
            }
            debug!(target: "direct_link", %url, "candidate missing");
        }
        Err(DirectLinkError::ThumbnailUnavailable(id.to_string()))
    }

    pub async fn fetch(&self, link: &str) -> Result<FetchedThumbnail, DirectLinkError> {
        let video_id = VideoId::extract(link)?;
        let url = self.find_candidate(&video_id).await?;

        let bytes = self
            .source
            .fetch(&url)
            .await
            .map_err(|reason| DirectLinkError::DownloadFailed {
                url: url.clone(),
                reason,
            })?;
        if bytes.is_empty() {
            return Err(DirectLinkError::DownloadFailed {
                url,
                reason: "empty body".to_string(),
            });
        }

        info!(target: "direct_link", %video_id, %url, bytes = bytes.len(), "thumbnail fetched");
        Ok(FetchedThumbnail {
            file_name: format!("thumbnail-{video_id}.jpg"),
            video_id,
            url,
            bytes,
        })
    }
}
