//! Participants currently connected to the server.

use apiary_core::{ActorId, Millis};
use serde::{Deserialize, Serialize};

/// Public view of a connected participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub id: ActorId,
    pub name: String,
    pub joined_at: Millis,
    pub last_active: Millis,
}

/// Connected participants in join order.
#[derive(Debug, Default)]
pub struct Roster {
    users: Vec<OnlineUser>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `actor` under a generated display name.
    pub fn join(&mut self, actor: &str, now: Millis) -> OnlineUser {
        let short: String = actor.chars().take(8).collect();
        let user = OnlineUser {
            id: actor.to_string(),
            name: format!("User {short}"),
            joined_at: now,
            last_active: now,
        };
        self.users.retain(|u| u.id != actor);
        self.users.push(user.clone());
        user
    }

    pub fn leave(&mut self, actor: &str) -> Option<OnlineUser> {
        let index = self.users.iter().position(|u| u.id == actor)?;
        Some(self.users.remove(index))
    }

    pub fn touch(&mut self, actor: &str, now: Millis) {
        if let Some(user) = self.users.iter_mut().find(|u| u.id == actor) {
            user.last_active = now;
        }
    }

    /// Rename `actor`; returns the previous name.
    ///
    /// Blank names are refused and leave the roster untouched.
    pub fn rename(&mut self, actor: &str, name: &str) -> Option<String> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let user = self.users.iter_mut().find(|u| u.id == actor)?;
        Some(std::mem::replace(&mut user.name, name.to_string()))
    }

    /// Display name of `actor`, or the raw id once they have left.
    pub fn name_of(&self, actor: &str) -> String {
        self.users
            .iter()
            .find(|u| u.id == actor)
            .map(|u| u.name.clone())
            .unwrap_or_else(|| actor.to_string())
    }

    pub fn online(&self) -> Vec<OnlineUser> {
        self.users.clone()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
