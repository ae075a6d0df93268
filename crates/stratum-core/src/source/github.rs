//! GitHub REST endpoints and payloads.
//!
//! Payload structs follow the API response schema and convert into the
//! store's records. Request builders never touch the network; the `fetch_*`
//! helpers run them through the [`Executor`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::{CrawlConfig, PAGE_SIZE};
use crate::errors::{CrawlError, CrawlResult};
use crate::models::{ChildRecord, ContainerRecord, QueryDescriptor, Target};
use crate::source::executor::Executor;
use crate::source::transport::{Request, Response};
use crate::source::Page;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct SearchPayload<T> {
    pub total_count: u64,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct OwnerPayload {
    pub id: i64,
    pub login: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RepositoryPayload {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub description: Option<String>,
    pub url: String,
    #[serde(default)]
    pub fork: bool,
    pub owner: OwnerPayload,
}

impl From<&RepositoryPayload> for ContainerRecord {
    fn from(repo: &RepositoryPayload) -> Self {
        ContainerRecord {
            id: repo.id,
            name: repo.name.clone(),
            full_name: repo.full_name.clone(),
            description: repo.description.clone(),
            url: repo.url.clone(),
            fork: repo.fork,
            owner_id: repo.owner.id,
            owner_login: repo.owner.login.clone(),
        }
    }
}

/// One code search hit.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CodeHit {
    pub name: String,
    pub path: String,
    pub sha: String,
    /// Contents API URL of the blob.
    pub url: String,
    pub repository: RepositoryPayload,
}

impl CodeHit {
    pub fn child_record(&self) -> ChildRecord {
        ChildRecord {
            name: self.name.clone(),
            path: self.path.clone(),
            sha: self.sha.clone(),
            container_id: self.repository.id,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ContentPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
}

impl ContentPayload {
    pub fn is_file(&self) -> bool {
        self.kind == "file"
    }

    /// Decoded blob bytes. The API wraps base64 at 60 columns.
    pub fn decode(&self) -> CrawlResult<Vec<u8>> {
        let raw = self
            .content
            .as_deref()
            .ok_or_else(|| CrawlError::Decode(format!("blob {} has no content", self.sha)))?;
        match self.encoding.as_deref() {
            Some("base64") | None => {
                let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
                BASE64
                    .decode(compact.as_bytes())
                    .map_err(|e| CrawlError::Decode(format!("blob {}: {e}", self.sha)))
            }
            Some("utf-8") | Some("utf8") => Ok(raw.as_bytes().to_vec()),
            Some(other) => Err(CrawlError::Decode(format!(
                "blob {} has unsupported encoding {other}",
                self.sha
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SignaturePayload {
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CommitDetailPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub committer: Option<SignaturePayload>,
    #[serde(default)]
    pub author: Option<SignaturePayload>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ParentPayload {
    pub sha: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CommitPayload {
    pub sha: String,
    pub commit: CommitDetailPayload,
    #[serde(default)]
    pub parents: Vec<ParentPayload>,
}

impl CommitPayload {
    /// Committer date, falling back to the author date.
    pub fn date(&self) -> Option<String> {
        self.commit
            .committer
            .as_ref()
            .and_then(|s| s.date.clone())
            .or_else(|| self.commit.author.as_ref().and_then(|s| s.date.clone()))
    }

    pub fn parent_shas(&self) -> Vec<String> {
        self.parents.iter().map(|p| p.sha.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Decoders
// ---------------------------------------------------------------------------

/// Search endpoints: `{total_count, items}` plus a `Link` header.
pub fn decode_search<T: DeserializeOwned>(response: &Response) -> CrawlResult<Page<T>> {
    let payload: SearchPayload<T> = response.json()?;
    Ok(Page {
        total_count: Some(payload.total_count),
        items: payload.items,
        next: response.next_link(),
    })
}

/// Listing endpoints: a bare JSON array plus a `Link` header.
pub fn decode_list<T: DeserializeOwned>(response: &Response) -> CrawlResult<Page<T>> {
    let items: Vec<T> = response.json()?;
    Ok(Page {
        total_count: None,
        items,
        next: response.next_link(),
    })
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitHub {
    api_base: String,
    raw_base: String,
}

impl GitHub {
    pub fn new(api_base: &str, raw_base: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            raw_base: raw_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &CrawlConfig) -> Self {
        Self::new(&config.api_base, &config.raw_base)
    }

    pub fn search_url(&self, target: Target) -> String {
        match target {
            Target::Code => format!("{}/search/code", self.api_base),
            Target::Repositories => format!("{}/search/repositories", self.api_base),
        }
    }

    /// Stratified search. Code hits are sorted by index recency, repositories
    /// by last update.
    pub fn search_request(&self, target: Target, query: &QueryDescriptor) -> Request {
        let sort = match target {
            Target::Code => "indexed",
            Target::Repositories => "updated",
        };
        Request::api(self.search_url(target))
            .param("q", query.q())
            .param("sort", sort)
            .param("order", query.order.as_param())
            .param("per_page", PAGE_SIZE.to_string())
    }

    /// Code search restricted to one repository.
    pub fn repository_files_request(&self, child_query: &str, full_name: &str) -> Request {
        Request::api(self.search_url(Target::Code))
            .param("q", format!("{} repo:{full_name}", child_query.trim()))
            .param("per_page", PAGE_SIZE.to_string())
    }

    pub fn commits_request(&self, full_name: &str, path: &str) -> Request {
        Request::api(format!("{}/repos/{full_name}/commits", self.api_base))
            .param("path", path)
            .param("per_page", PAGE_SIZE.to_string())
    }

    pub fn contents_request(&self, hit: &CodeHit) -> Request {
        Request::api(hit.url.replace('#', "%23"))
    }

    pub fn raw_request(&self, full_name: &str, sha: &str, path: &str) -> Request {
        Request::raw(format!(
            "{}/{full_name}/{sha}/{}",
            self.raw_base,
            encode_path(path)
        ))
    }

    pub fn fetch_code_search(
        &self,
        exec: &mut Executor,
        query: &QueryDescriptor,
    ) -> CrawlResult<Page<CodeHit>> {
        let res = exec.execute(&self.search_request(Target::Code, query))?;
        decode_search(&res)
    }

    pub fn fetch_repository_search(
        &self,
        exec: &mut Executor,
        query: &QueryDescriptor,
    ) -> CrawlResult<Page<RepositoryPayload>> {
        let res = exec.execute(&self.search_request(Target::Repositories, query))?;
        decode_search(&res)
    }

    /// Total count of a search, for the overall population estimate.
    pub fn fetch_total(
        &self,
        exec: &mut Executor,
        target: Target,
        query: &QueryDescriptor,
    ) -> CrawlResult<u64> {
        let res = exec.execute(&self.search_request(target, query))?;
        let payload: SearchPayload<serde_json::Value> = res.json()?;
        Ok(payload.total_count)
    }

    pub fn fetch_repository_files(
        &self,
        exec: &mut Executor,
        child_query: &str,
        full_name: &str,
    ) -> CrawlResult<Page<CodeHit>> {
        let res = exec.execute(&self.repository_files_request(child_query, full_name))?;
        decode_search(&res)
    }

    pub fn fetch_commits(
        &self,
        exec: &mut Executor,
        full_name: &str,
        path: &str,
    ) -> CrawlResult<Page<CommitPayload>> {
        let res = exec.execute(&self.commits_request(full_name, path))?;
        decode_list(&res)
    }

    pub fn fetch_contents(&self, exec: &mut Executor, hit: &CodeHit) -> CrawlResult<ContentPayload> {
        let res = exec.execute(&self.contents_request(hit))?;
        res.json()
    }

    pub fn fetch_raw(
        &self,
        exec: &mut Executor,
        full_name: &str,
        sha: &str,
        path: &str,
    ) -> CrawlResult<Vec<u8>> {
        Ok(exec.execute(&self.raw_request(full_name, sha, path))?.body)
    }
}

/// Percent-encode each segment of a repository path, keeping the slashes.
fn encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
