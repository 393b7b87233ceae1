//! Executed request/response history, bundles, export and import.
//!
//! The HTTP executor lives outside the core. It hands over a
//! [`StoredRequest`] and the [`ResponseEnvelope`] it produced; the
//! [`HistoryBook`] wraps them into an immutable [`HistoryEntry`] with a
//! readable label and a tag set, keeps them in a [`Ledger`], and lets
//! participants group entries into shareable [`Bundle`]s.

use std::collections::HashMap;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Millis;
use crate::error::{CoreError, CoreResult, RecordKind};
use crate::ledger::{Ledger, LedgerEntry, LedgerError, PruneStats};
use crate::value::{FieldMap, FieldValue};
use crate::ActorId;

/// Header map, order preserved as received.
pub type Headers = IndexMap<String, String>;

/// Well-known hosts and their display names.
const FRIENDLY_HOSTS: &[(&str, &str)] = &[
    ("jsonplaceholder.typicode.com", "Practice API"),
    ("api.github.com", "GitHub"),
    ("httpbin.org", "HTTP Testing"),
    ("reqres.in", "Test API"),
];

/// URL substrings that contribute a tag.
const URL_KEYWORD_TAGS: &[(&str, &str)] = &[
    ("user", "users"),
    ("post", "posts"),
    ("comment", "comments"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Auth {
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// A request definition as it was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<FieldValue>,
    pub auth: Option<Auth>,
}

impl StoredRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Headers::new(),
            body: None,
            auth: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<FieldValue>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Result envelope produced by the external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub headers: Headers,
    pub body: FieldValue,
    pub response_time_ms: u64,
}

impl ResponseEnvelope {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: FieldValue::Null,
            response_time_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Content type header, matched case-insensitively.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMetadata {
    pub label: String,
    pub tags: Vec<String>,
    /// Caller-supplied metadata, stored verbatim.
    pub extra: FieldMap,
}

/// One executed request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub actor: ActorId,
    pub timestamp: Millis,
    pub sequence: Option<u64>,
    pub request: StoredRequest,
    pub response: ResponseEnvelope,
    pub metadata: HistoryMetadata,
}

impl LedgerEntry for HistoryEntry {
    fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    fn stamp(&mut self, sequence: u64) {
        self.sequence = Some(sequence);
    }

    fn timestamp(&self) -> Millis {
        self.timestamp
    }

    fn actor(&self) -> &str {
        &self.actor
    }
}

/// Display label: `"{METHOD} request to {host name}"`.
pub fn request_label(request: &StoredRequest) -> String {
    let method = request.method.to_uppercase();
    let target = match url::Url::parse(&request.url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => {
                let host = host.strip_prefix("www.").unwrap_or(host);
                FRIENDLY_HOSTS
                    .iter()
                    .find(|(known, _)| *known == host)
                    .map_or_else(|| host.to_string(), |(_, name)| name.to_string())
            }
            None => request.url.clone(),
        },
        Err(_) => request.url.clone(),
    };
    format!("{method} request to {target}")
}

/// Tags derived from method, status, content type and URL keywords.
pub fn request_tags(request: &StoredRequest, response: &ResponseEnvelope) -> Vec<String> {
    let mut tags = vec![request.method.to_lowercase()];

    if response.is_success() {
        tags.push("success".to_string());
    } else if response.status >= 400 {
        tags.push("error".to_string());
    }

    if response
        .content_type()
        .is_some_and(|ct| ct.contains("json"))
    {
        tags.push("json".to_string());
    }

    let url = request.url.to_lowercase();
    for (needle, tag) in URL_KEYWORD_TAGS {
        if url.contains(needle) {
            tags.push(tag.to_string());
        }
    }
    tags
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRequest {
    pub name: String,
    pub request: StoredRequest,
    pub tags: Vec<String>,
}

/// Where an imported bundle came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleOrigin {
    pub original_id: Uuid,
    pub imported_by: ActorId,
    pub imported_at: Millis,
}

/// A named, shareable group of request definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_by: ActorId,
    pub created_at: Millis,
    pub requests: Vec<BundleRequest>,
    pub collaborators: Vec<ActorId>,
    pub is_public: bool,
    #[serde(default)]
    pub origin: Option<BundleOrigin>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
}

/// Serialized form of an exported bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExportDocument {
    #[serde(flatten)]
    bundle: Bundle,
    #[serde(default)]
    exported_at: Option<Millis>,
    #[serde(default)]
    format: Option<ExportFormat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedBundle {
    pub bundle: Bundle,
    pub exported_at: Millis,
    pub format: ExportFormat,
    pub filename: String,
    /// The bundle plus export stamp, serialized in `format`.
    pub payload: String,
}

fn export_filename(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{stem}_collection.json")
}

/// History ledger plus the bundles built from it.
#[derive(Debug)]
pub struct HistoryBook {
    entries: Ledger<HistoryEntry>,
    bundles: HashMap<Uuid, Bundle>,
    global_cap: usize,
}

impl HistoryBook {
    /// `global_cap` bounds the total number of entries kept.
    pub fn new(global_cap: usize) -> Self {
        Self {
            entries: Ledger::new(),
            bundles: HashMap::new(),
            global_cap,
        }
    }

    pub fn save(
        &mut self,
        request: StoredRequest,
        response: ResponseEnvelope,
        actor: &str,
        extra: FieldMap,
        now: Millis,
    ) -> Result<HistoryEntry, LedgerError> {
        let metadata = HistoryMetadata {
            label: request_label(&request),
            tags: request_tags(&request, &response),
            extra,
        };
        let mut entry = HistoryEntry {
            id: Uuid::new_v4(),
            actor: actor.to_string(),
            timestamp: now,
            sequence: None,
            request,
            response,
            metadata,
        };

        let stored = entry.clone();
        let seq = self.entries.append(stored)?;
        entry.sequence = Some(seq);

        let dropped = self.entries.truncate_to(self.global_cap);
        if dropped > 0 {
            log::debug!("History over capacity, dropped {dropped} oldest entries");
        }
        log::info!("Saved history entry {} for {actor}: {}", entry.id, entry.metadata.label);
        Ok(entry)
    }

    pub fn get(&self, id: &Uuid) -> Option<&HistoryEntry> {
        self.entries.find(|e| &e.id == id)
    }

    /// `actor`'s entries, newest first.
    pub fn user_history(&self, actor: &str, limit: usize) -> Vec<HistoryEntry> {
        self.entries
            .recent_matching(move |e| e.actor == actor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Entries of every actor, newest first.
    pub fn all_history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.entries.recent(limit).into_iter().cloned().collect()
    }

    /// The stored request of entry `id`, verbatim.
    pub fn replay(&self, id: &Uuid, actor: &str) -> CoreResult<StoredRequest> {
        let entry = self
            .get(id)
            .ok_or_else(|| CoreError::not_found(RecordKind::HistoryEntry, id))?;
        log::info!("{actor} is replaying history entry {id}");
        Ok(entry.request.clone())
    }

    /// Group existing entries into a new bundle. Unknown ids are skipped.
    pub fn bundle(
        &mut self,
        name: &str,
        history_ids: &[Uuid],
        actor: &str,
        description: &str,
        now: Millis,
    ) -> CoreResult<Bundle> {
        let requests: Vec<BundleRequest> = history_ids
            .iter()
            .filter_map(|id| self.get(id))
            .map(|entry| BundleRequest {
                name: entry.metadata.label.clone(),
                request: entry.request.clone(),
                tags: entry.metadata.tags.clone(),
            })
            .collect();

        if requests.is_empty() {
            return Err(CoreError::EmptySelection);
        }

        let bundle = Bundle {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            created_by: actor.to_string(),
            created_at: now,
            requests,
            collaborators: vec![actor.to_string()],
            is_public: false,
            origin: None,
        };
        log::info!(
            "{actor} created bundle \"{name}\" with {} request(s)",
            bundle.requests.len()
        );
        self.bundles.insert(bundle.id, bundle.clone());
        Ok(bundle)
    }

    pub fn get_bundle(&self, id: &Uuid) -> Option<&Bundle> {
        self.bundles.get(id)
    }

    pub fn export_bundle(
        &self,
        id: &Uuid,
        format: ExportFormat,
        now: Millis,
    ) -> CoreResult<ExportedBundle> {
        let bundle = self
            .bundles
            .get(id)
            .ok_or_else(|| CoreError::not_found(RecordKind::Bundle, id))?;

        let document = ExportDocument {
            bundle: bundle.clone(),
            exported_at: Some(now),
            format: Some(format),
        };
        let payload = match format {
            ExportFormat::Json => serde_json::to_string_pretty(&document)
                .map_err(|e| CoreError::InvalidArgument(e.to_string()))?,
        };

        Ok(ExportedBundle {
            bundle: bundle.clone(),
            exported_at: now,
            format,
            filename: export_filename(&bundle.name),
            payload,
        })
    }

    /// Accept an exported (or bare) bundle under a fresh id.
    pub fn import_bundle(&mut self, payload: &str, actor: &str, now: Millis) -> CoreResult<Bundle> {
        let document: ExportDocument = serde_json::from_str(payload).map_err(|e| {
            log::warn!("Rejected bundle import from {actor}: {e}");
            CoreError::Import(e.to_string())
        })?;

        let mut bundle = document.bundle;
        let original_id = bundle.id;
        bundle.id = Uuid::new_v4();
        bundle.origin = Some(BundleOrigin {
            original_id,
            imported_by: actor.to_string(),
            imported_at: now,
        });
        if !bundle.collaborators.iter().any(|c| c == actor) {
            bundle.collaborators.push(actor.to_string());
        }

        log::info!(
            "{actor} imported bundle \"{}\" with {} request(s)",
            bundle.name,
            bundle.requests.len()
        );
        self.bundles.insert(bundle.id, bundle.clone());
        Ok(bundle)
    }

    /// Age- then count-based retention.
    pub fn prune(&mut self, max_age: Duration, per_actor_cap: usize, now: Millis) -> PruneStats {
        PruneStats {
            by_age: self.entries.prune_older_than(max_age, now),
            by_count: self.entries.prune_to_count_per_actor(per_actor_cap),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bundle_count(&self) -> usize {
        self.bundles.len()
    }
}
