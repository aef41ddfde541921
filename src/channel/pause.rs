use crate::log::target_key_from_token;
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Opaque handle identifying one reason a channel is paused.
///
/// A channel resumes only once every token that paused it has been used to
/// resume it; resuming twice with the same token has no further effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PauseToken(Uuid);

impl PauseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PauseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PauseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Send-side suppression layered on top of a unit's enabled/suspended state.
/// Neither mechanism ever blocks persistence.
#[derive(Debug, Default)]
pub struct PauseTracker {
    paused_by: HashSet<PauseToken>,
    paused_target_keys: HashSet<String>,
}

impl PauseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the token was not already pausing.
    pub fn pause(&mut self, token: PauseToken) -> bool {
        self.paused_by.insert(token)
    }

    /// Returns true if the token was pausing. Unknown tokens are ignored.
    pub fn resume(&mut self, token: PauseToken) -> bool {
        self.paused_by.remove(&token)
    }

    /// True while any token pauses the whole unit
    pub fn is_paused(&self) -> bool {
        !self.paused_by.is_empty()
    }

    pub fn pause_target_token(&mut self, token: &str) -> bool {
        self.paused_target_keys
            .insert(target_key_from_token(token).to_string())
    }

    pub fn resume_target_token(&mut self, token: &str) -> bool {
        self.paused_target_keys.remove(target_key_from_token(token))
    }

    pub fn paused_target_keys(&self) -> &HashSet<String> {
        &self.paused_target_keys
    }
}
