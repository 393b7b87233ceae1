//! Live shared collections of request definitions.
//!
//! A collection only grows: requests are appended, and the collaborator set
//! only gains members. Only collaborators may append.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Millis;
use crate::error::{CoreError, CoreResult, RecordKind};
use crate::history::StoredRequest;
use crate::ActorId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRequest {
    pub id: Uuid,
    pub request: StoredRequest,
    pub added_by: ActorId,
    pub added_at: Millis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub requests: Vec<CollectionRequest>,
    pub created_by: ActorId,
    pub created_at: Millis,
    pub collaborators: Vec<ActorId>,
}

impl Collection {
    pub fn is_collaborator(&self, actor: &str) -> bool {
        self.collaborators.iter().any(|c| c == actor)
    }
}

/// Collections keyed by id, iterated in creation order.
#[derive(Debug, Default)]
pub struct CollectionRegistry {
    collections: IndexMap<Uuid, Collection>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        name: &str,
        description: &str,
        actor: &str,
        now: Millis,
    ) -> CoreResult<Collection> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidArgument(
                "collection name must not be empty".into(),
            ));
        }

        let collection = Collection {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            requests: Vec::new(),
            created_by: actor.to_string(),
            created_at: now,
            collaborators: vec![actor.to_string()],
        };
        log::info!("{actor} created collection \"{name}\" ({})", collection.id);
        self.collections.insert(collection.id, collection.clone());
        Ok(collection)
    }

    /// Add `actor` to the collaborator set. Joining twice is a no-op.
    pub fn join(&mut self, id: &Uuid, actor: &str) -> CoreResult<Collection> {
        let collection = self
            .collections
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found(RecordKind::Collection, id))?;
        if !collection.is_collaborator(actor) {
            collection.collaborators.push(actor.to_string());
            log::info!("{actor} joined collection {id}");
        }
        Ok(collection.clone())
    }

    /// Append a request definition; `actor` must be a collaborator.
    ///
    /// Returns the new entry together with the collaborators to notify.
    pub fn add_request(
        &mut self,
        id: &Uuid,
        request: StoredRequest,
        actor: &str,
        now: Millis,
    ) -> CoreResult<(CollectionRequest, Vec<ActorId>)> {
        let collection = self
            .collections
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found(RecordKind::Collection, id))?;
        if !collection.is_collaborator(actor) {
            return Err(CoreError::NotCollaborator {
                collection: id.to_string(),
                actor: actor.to_string(),
            });
        }

        let entry = CollectionRequest {
            id: Uuid::new_v4(),
            request,
            added_by: actor.to_string(),
            added_at: now,
        };
        collection.requests.push(entry.clone());
        log::debug!(
            "{actor} added request {} to collection {id} ({} total)",
            entry.id,
            collection.requests.len()
        );
        Ok((entry, collection.collaborators.clone()))
    }

    pub fn get(&self, id: &Uuid) -> Option<&Collection> {
        self.collections.get(id)
    }

    /// Collections `actor` collaborates on, in creation order.
    pub fn for_actor(&self, actor: &str) -> Vec<Collection> {
        self.collections
            .values()
            .filter(|c| c.is_collaborator(actor))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}
