//! Bearer-token claims and box-level authorization.
//!
//! Token issuance lives elsewhere; the daemon ships a static token table.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use escalada_store::BoxId;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, LiveError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Judge,
    Viewer,
    Spectator,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Judge => "judge",
            Role::Viewer => "viewer",
            Role::Spectator => "spectator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub username: String,
    pub role: Role,
    #[serde(default)]
    pub boxes: BTreeSet<BoxId>,
}

impl Claims {
    pub fn new(username: impl Into<String>, role: Role) -> Self {
        Self {
            username: username.into(),
            role,
            boxes: BTreeSet::new(),
        }
    }

    pub fn with_boxes(mut self, boxes: impl IntoIterator<Item = BoxId>) -> Self {
        self.boxes = boxes.into_iter().collect();
        self
    }

    /// Full-state channel and state reads. Viewers without assigned boxes
    /// see every box; spectators only get the public channel.
    pub fn can_view(&self, box_id: BoxId) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Judge => self.boxes.contains(&box_id),
            Role::Viewer => self.boxes.is_empty() || self.boxes.contains(&box_id),
            Role::Spectator => false,
        }
    }

    pub fn can_command(&self, box_id: BoxId) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Judge => self.boxes.contains(&box_id),
            Role::Viewer | Role::Spectator => false,
        }
    }

    pub fn authorize_view(&self, box_id: BoxId) -> Result<(), AuthError> {
        if self.can_view(box_id) {
            Ok(())
        } else {
            Err(self.forbidden(box_id))
        }
    }

    pub fn authorize_command(&self, box_id: BoxId) -> Result<(), AuthError> {
        if self.can_command(box_id) {
            Ok(())
        } else {
            Err(self.forbidden(box_id))
        }
    }

    pub fn require_role(&self, allowed: &[Role]) -> Result<(), AuthError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(AuthError::WrongRole(self.role.as_str().to_string()))
        }
    }

    fn forbidden(&self, box_id: BoxId) -> AuthError {
        AuthError::Forbidden {
            role: self.role.as_str().to_string(),
            box_id,
        }
    }
}

pub trait Authorizer: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Fixed token → claims table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StaticTokens {
    tokens: HashMap<String, Claims>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, claims: Claims) -> Self {
        self.tokens.insert(token.into(), claims);
        self
    }

    /// Load a JSON object of `token -> {username, role, boxes}`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LiveError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LiveError::Config(format!("read token table {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| LiveError::Config(format!("parse token table {}: {e}", path.display())))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authorizer for StaticTokens {
    fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_scopes() {
        let judge = Claims::new("j", Role::Judge).with_boxes([1, 2]);
        assert!(judge.can_view(1) && judge.can_command(2));
        assert!(!judge.can_view(3));

        let viewer = Claims::new("v", Role::Viewer);
        assert!(viewer.can_view(42));
        assert!(!viewer.can_command(42));
        let scoped = Claims::new("v", Role::Viewer).with_boxes([7]);
        assert!(scoped.can_view(7) && !scoped.can_view(8));

        let spectator = Claims::new("s", Role::Spectator);
        assert!(!spectator.can_view(1));
        assert!(matches!(
            spectator.authorize_view(1),
            Err(AuthError::Forbidden { box_id: 1, .. })
        ));
        assert!(Claims::new("a", Role::Admin).can_command(99));
    }

    #[test]
    fn static_table_parses_and_authenticates() {
        let tokens: StaticTokens = serde_json::from_value(serde_json::json!({
            "t-admin": { "username": "root", "role": "admin" },
            "t-judge": { "username": "ana", "role": "judge", "boxes": [3] }
        }))
        .unwrap();
        assert_eq!(tokens.authenticate("t-judge").unwrap().boxes.len(), 1);
        assert_eq!(tokens.authenticate("nope"), Err(AuthError::InvalidToken));
        assert_eq!(tokens.authenticate(""), Err(AuthError::MissingToken));
    }
}
