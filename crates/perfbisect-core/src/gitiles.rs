//! Gitiles-backed [`SourceRepo`].
//!
//! - `GET {repo}/+log/{range}?format=JSON` (paged through `next`)
//! - `GET {repo}/+/{rev}/{path}?format=TEXT` (base64 body)
//!
//! JSON responses start with the `)]}'` XSSI guard, which is stripped
//! before parsing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use crate::domain::{BisectError, Result};
use crate::source::{CachingRepoProvider, CommitInfo, SourceRepo};

const XSSI_PREFIX: &str = ")]}'";
/// Hard stop for runaway pagination.
const MAX_LOG_PAGES: usize = 100;

#[derive(Debug, Deserialize)]
struct LogPage {
    #[serde(default)]
    log: Vec<LogEntry>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogEntry {
    commit: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    author: Option<Person>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Person {
    #[serde(default)]
    email: String,
}

impl LogEntry {
    fn into_commit_info(self) -> CommitInfo {
        CommitInfo {
            hash: self.commit,
            parents: self.parents,
            author: self.author.map(|a| a.email).unwrap_or_default(),
            subject: self.message.lines().next().unwrap_or_default().to_string(),
        }
    }
}

/// Parse one `?format=JSON` log page.
fn parse_log_page(body: &str) -> serde_json::Result<LogPage> {
    let json = body.trim_start().trim_start_matches(XSSI_PREFIX);
    serde_json::from_str(json)
}

/// Walk first parents from the newest commit of `commits` until leaving the
/// set. `commits` is the full `start..end` log, newest first.
fn first_parent_chain(commits: Vec<CommitInfo>) -> Vec<CommitInfo> {
    let Some(head) = commits.first().map(|c| c.hash.clone()) else {
        return Vec::new();
    };
    let mut by_hash: HashMap<String, CommitInfo> =
        commits.into_iter().map(|c| (c.hash.clone(), c)).collect();

    let mut chain = Vec::new();
    let mut cursor = Some(head);
    while let Some(hash) = cursor {
        let Some(commit) = by_hash.remove(&hash) else {
            break;
        };
        cursor = commit.parents.first().cloned();
        chain.push(commit);
    }
    chain
}

/// Client for one Gitiles repository.
pub struct GitilesRepo {
    url: String,
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl GitilesRepo {
    pub fn new(url: &str, client: reqwest::Client) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            client,
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    fn err(&self, reason: impl std::fmt::Display) -> BisectError {
        BisectError::SourceControl {
            repository_url: self.url.clone(),
            reason: reason.to_string(),
        }
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let mut req = self.client.get(url);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| self.err(e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(self.err(format!("GET {url} returned {status}")));
        }
        resp.text().await.map_err(|e| self.err(e))
    }
}

#[async_trait]
impl SourceRepo for GitilesRepo {
    fn url(&self) -> &str {
        &self.url
    }

    async fn log(&self, range: &str) -> Result<Vec<CommitInfo>> {
        let mut out = Vec::new();
        let mut next: Option<String> = None;
        for _ in 0..MAX_LOG_PAGES {
            let mut url = format!("{}/+log/{}?format=JSON", self.url, range);
            if let Some(cursor) = &next {
                url.push_str("&s=");
                url.push_str(cursor);
            }
            let body = self.get_text(&url).await?;
            let page = parse_log_page(&body).map_err(|e| self.err(e))?;
            out.extend(page.log.into_iter().map(LogEntry::into_commit_info));
            match page.next {
                Some(cursor) if !cursor.is_empty() => next = Some(cursor),
                _ => {
                    debug!(repo = %self.url, range = %range, commits = out.len(), "log fetched");
                    return Ok(out);
                }
            }
        }
        Err(self.err(format!("log {range} exceeded {MAX_LOG_PAGES} pages")))
    }

    async fn log_linear(&self, start: &str, end: &str) -> Result<Vec<CommitInfo>> {
        let all = self.log(&format!("{start}..{end}")).await?;
        Ok(first_parent_chain(all))
    }

    async fn read_file_at_ref(&self, path: &str, revision: &str) -> Result<Vec<u8>> {
        let url = format!("{}/+/{}/{}?format=TEXT", self.url, revision, path);
        let body = self.get_text(&url).await?;
        let compact: String = body.split_whitespace().collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact)
            .map_err(|e| self.err(format!("bad base64 for {path}@{revision}: {e}")))
    }
}

/// A caching provider that creates a [`GitilesRepo`] per URL.
pub fn gitiles_provider(auth_token: Option<String>) -> Result<CachingRepoProvider> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("perfbisect/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| BisectError::SourceControl {
            repository_url: String::new(),
            reason: format!("failed to create HTTP client: {e}"),
        })?;
    Ok(CachingRepoProvider::new(move |url| {
        let repo = GitilesRepo::new(url, client.clone()).with_auth_token(auth_token.clone());
        Ok(Arc::new(repo) as Arc<dyn SourceRepo>)
    }))
}
