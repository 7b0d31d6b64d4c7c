//! Role configuration consumed by dispatch.
//!
//! Roles are data, not behavior: a stable id, a backend model, a thinking
//! level, and instruction text (inline or in a prompt file). Loaded from
//! `roles.json` under the data root with a short TTL cache; unknown ids fall
//! back to the built-in set so a fresh data dir can still run a pipeline.

use crate::gateway::ThinkingLevel;
use crate::store;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, Instant};

const ROLE_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub thinking: ThinkingLevel,
    /// Inline instruction text. Takes precedence over `prompt_file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Markdown file under `<data>/prompts/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<String>,
}

impl Role {
    fn simple(id: &str, name: &str, instructions: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            model: "default".to_string(),
            thinking: ThinkingLevel::Low,
            instructions: Some(instructions.to_string()),
            prompt_file: None,
        }
    }

    /// Roles every pipeline needs even before the operator writes roles.json.
    pub fn builtin_defaults() -> Vec<Role> {
        vec![
            Role::simple(
                "builder",
                "Builder",
                "You implement one task in an isolated git worktree. Commit your work on the current branch.",
            ),
            Role::simple(
                "reviewer",
                "Code Reviewer",
                "You review the merged phase branch for correctness and report findings.",
            ),
            Role::simple(
                "security-reviewer",
                "Security Reviewer",
                "You review the merged phase branch for security issues and report findings.",
            ),
            Role::simple(
                "designer",
                "Design Reviewer",
                "You review the merged phase branch for UX and API design quality.",
            ),
            Role::simple(
                "fixer",
                "Fixer",
                "You address review findings on the phase branch and commit the fixes.",
            ),
            Role::simple(
                "conflict-resolver",
                "Conflict Resolver",
                "You resolve git merge conflicts on the phase branch and commit the resolution.",
            ),
            Role::simple(
                "spec-writer",
                "Spec Writer",
                "You turn an interview transcript into an implementation plan and an annotated task list.",
            ),
        ]
    }
}

/// TTL-cached loader for `roles.json` + prompt files.
pub struct RoleStore {
    roles_path: PathBuf,
    prompts_dir: PathBuf,
    cache: RwLock<Option<(Instant, HashMap<String, Role>)>>,
}

impl RoleStore {
    pub fn new(roles_path: impl Into<PathBuf>, prompts_dir: impl Into<PathBuf>) -> Self {
        Self {
            roles_path: roles_path.into(),
            prompts_dir: prompts_dir.into(),
            cache: RwLock::new(None),
        }
    }

    fn load(&self) -> Result<HashMap<String, Role>> {
        if let Some((at, roles)) = self.cache.read().expect("role cache poisoned").as_ref()
            && at.elapsed() < ROLE_CACHE_TTL
        {
            return Ok(roles.clone());
        }

        let mut roles: HashMap<String, Role> = Role::builtin_defaults()
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let configured: Vec<Role> = store::read_json(&self.roles_path)?.unwrap_or_default();
        for role in configured {
            roles.insert(role.id.clone(), role);
        }

        *self.cache.write().expect("role cache poisoned") = Some((Instant::now(), roles.clone()));
        Ok(roles)
    }

    pub fn get(&self, id: &str) -> Result<Option<Role>> {
        Ok(self.load()?.get(id).cloned())
    }

    pub fn all(&self) -> Result<Vec<Role>> {
        let mut roles: Vec<Role> = self.load()?.into_values().collect();
        roles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(roles)
    }

    /// Resolve a role's instruction text, following `prompt_file` if set.
    pub fn instructions_for(&self, role: &Role) -> Result<String> {
        if let Some(file) = &role.prompt_file {
            let path = self.prompts_dir.join(file);
            match std::fs::read_to_string(&path) {
                Ok(text) => return Ok(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(role.instructions.clone().unwrap_or_default())
    }

    pub fn invalidate(&self) {
        *self.cache.write().expect("role cache poisoned") = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builtin_roles_cover_the_review_chain() {
        let store = RoleStore::new("/nonexistent/roles.json", "/nonexistent/prompts");
        for id in ["builder", "reviewer", "security-reviewer", "designer", "fixer"] {
            assert!(store.get(id).unwrap().is_some(), "missing builtin {id}");
        }
        assert!(store.get("astronaut").unwrap().is_none());
    }

    #[test]
    fn configured_roles_override_builtins() {
        let dir = tempdir().unwrap();
        let roles_path = dir.path().join("roles.json");
        let custom = vec![Role {
            id: "builder".to_string(),
            name: "Custom Builder".to_string(),
            model: "big-model".to_string(),
            thinking: ThinkingLevel::High,
            instructions: Some("custom".to_string()),
            prompt_file: None,
        }];
        store::write_json_atomic(&roles_path, &custom).unwrap();

        let store = RoleStore::new(&roles_path, dir.path().join("prompts"));
        let builder = store.get("builder").unwrap().unwrap();
        assert_eq!(builder.model, "big-model");
        // Builtins not overridden are still present
        assert!(store.get("reviewer").unwrap().is_some());
    }

    #[test]
    fn prompt_file_indirection() {
        let dir = tempdir().unwrap();
        let prompts = dir.path().join("prompts");
        std::fs::create_dir_all(&prompts).unwrap();
        std::fs::write(prompts.join("builder.md"), "# From file\n").unwrap();

        let store = RoleStore::new(dir.path().join("roles.json"), &prompts);
        let role = Role {
            id: "builder".to_string(),
            name: "B".to_string(),
            model: "default".to_string(),
            thinking: ThinkingLevel::Low,
            instructions: Some("inline fallback".to_string()),
            prompt_file: Some("builder.md".to_string()),
        };
        assert_eq!(store.instructions_for(&role).unwrap(), "# From file\n");

        let missing = Role {
            prompt_file: Some("absent.md".to_string()),
            ..role
        };
        assert_eq!(store.instructions_for(&missing).unwrap(), "inline fallback");
    }
}
