//! Entity definitions — the per-table metadata the engine needs.
//!
//! An [`EntityDef`] names a table, its required data fields, the foreign-key
//! field its sync scope is keyed by, and the fields worth indexing. The
//! definitions for the app's synchronizable entities live in
//! [`waveline_entities`]; the builder is public so tests (and future
//! entities) can define their own.

use std::sync::{Arc, OnceLock};

use serde_json::Value;

static NAME_REGEX: OnceLock<regex::Regex> = OnceLock::new();

fn name_regex() -> &'static regex::Regex {
    NAME_REGEX.get_or_init(|| {
        regex::Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("name regex is valid")
    })
}

/// Sync-metadata columns live outside `data` and cannot be declared as
/// entity fields.
pub(crate) const META_FIELDS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "synced_at",
    "needs_sync",
    "deleted",
];

/// Scope key used for entities without a scope field, and as the wildcard
/// scope for scoped ones.
pub const UNSCOPED_KEY: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// Ordering applied to `list`/`subscribe` results.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub dir: SortDir,
}

/// Complete definition of a synchronizable entity.
#[derive(Debug)]
pub struct EntityDef {
    pub name: String,
    /// Data fields that must be present and non-null on insert.
    pub required: Vec<String>,
    /// Foreign-key field the `(entity, scope_key)` sync unit is keyed by.
    /// `None` — the whole table is one scope.
    pub scope_field: Option<String>,
    /// Foreign-key fields to index for lookups.
    pub indexed: Vec<String>,
    pub order_by: OrderBy,
}

impl EntityDef {
    pub fn builder(name: impl Into<String>) -> EntityDefBuilder {
        EntityDefBuilder {
            name: name.into(),
            required: Vec::new(),
            scope_field: None,
            indexed: Vec::new(),
            order_by: OrderBy {
                field: "created_at".to_string(),
                dir: SortDir::Asc,
            },
        }
    }

    /// Scope key of a record's data under this definition.
    ///
    /// Scope fields are string-valued ids; a missing or non-string value
    /// falls back to the unscoped key.
    pub fn scope_key_of(&self, data: &Value) -> String {
        match &self.scope_field {
            None => UNSCOPED_KEY.to_string(),
            Some(field) => data
                .get(field)
                .and_then(Value::as_str)
                .unwrap_or(UNSCOPED_KEY)
                .to_string(),
        }
    }
}

/// Fluent builder for [`EntityDef`].
///
/// Panics on invalid or reserved field names — definitions are static
/// program structure, not runtime input.
pub struct EntityDefBuilder {
    name: String,
    required: Vec<String>,
    scope_field: Option<String>,
    indexed: Vec<String>,
    order_by: OrderBy,
}

impl EntityDefBuilder {
    pub fn required(mut self, fields: &[&str]) -> Self {
        for f in fields {
            validate_field_name(&self.name, f);
            self.required.push((*f).to_string());
        }
        self
    }

    pub fn scope(mut self, field: &str) -> Self {
        validate_field_name(&self.name, field);
        self.scope_field = Some(field.to_string());
        self
    }

    pub fn index(mut self, field: &str) -> Self {
        validate_field_name(&self.name, field);
        self.indexed.push(field.to_string());
        self
    }

    pub fn order_by_asc(mut self, field: &str) -> Self {
        self.order_by = OrderBy {
            field: field.to_string(),
            dir: SortDir::Asc,
        };
        self
    }

    pub fn order_by_desc(mut self, field: &str) -> Self {
        self.order_by = OrderBy {
            field: field.to_string(),
            dir: SortDir::Desc,
        };
        self
    }

    pub fn build(self) -> Arc<EntityDef> {
        assert!(
            name_regex().is_match(&self.name),
            "Invalid entity name \"{}\"",
            self.name
        );
        Arc::new(EntityDef {
            name: self.name,
            required: self.required,
            scope_field: self.scope_field,
            indexed: self.indexed,
            order_by: self.order_by,
        })
    }
}

fn validate_field_name(entity: &str, field: &str) {
    assert!(
        name_regex().is_match(field),
        "Invalid field name \"{field}\" on entity \"{entity}\""
    );
    assert!(
        !META_FIELDS.contains(&field),
        "Field \"{field}\" on entity \"{entity}\" collides with a sync metadata column"
    );
}

/// The app's synchronizable entities.
pub fn waveline_entities() -> Vec<Arc<EntityDef>> {
    vec![
        // Listening position per (episode, user). Pulled per user so a fresh
        // install can restore every episode's progress in one pass.
        EntityDef::builder("episode_progress")
            .required(&["episode_id", "user_id", "position_secs"])
            .scope("user_id")
            .index("episode_id")
            .order_by_desc("updated_at")
            .build(),
        // Discussion under an episode. parent_id threads replies; starter_id
        // links a comment to the conversation starter it answers.
        EntityDef::builder("comments")
            .required(&["episode_id", "user_id", "content"])
            .scope("episode_id")
            .index("user_id")
            .index("starter_id")
            .index("parent_id")
            .order_by_asc("created_at")
            .build(),
        EntityDef::builder("profiles")
            .required(&["display_name"])
            .order_by_asc("display_name")
            .build(),
        // Editorial picks for a given week, scoped by the week key.
        EntityDef::builder("weekly_selections")
            .required(&["week", "episode_id"])
            .scope("week")
            .index("episode_id")
            .order_by_asc("created_at")
            .build(),
        EntityDef::builder("notifications")
            .required(&["user_id", "kind"])
            .scope("user_id")
            .order_by_desc("created_at")
            .build(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scope_key_reads_scope_field() {
        let def = EntityDef::builder("comments")
            .required(&["episode_id", "content"])
            .scope("episode_id")
            .build();
        assert_eq!(def.scope_key_of(&json!({"episode_id": "ep-1"})), "ep-1");
        assert_eq!(def.scope_key_of(&json!({"content": "hi"})), UNSCOPED_KEY);
    }

    #[test]
    fn unscoped_entity_uses_wildcard_key() {
        let def = EntityDef::builder("profiles")
            .required(&["display_name"])
            .build();
        assert_eq!(def.scope_key_of(&json!({"display_name": "A"})), UNSCOPED_KEY);
    }

    #[test]
    #[should_panic(expected = "metadata column")]
    fn reserved_field_names_are_rejected() {
        let _ = EntityDef::builder("comments").required(&["needs_sync"]);
    }

    #[test]
    #[should_panic(expected = "Invalid entity name")]
    fn invalid_entity_name_is_rejected() {
        let _ = EntityDef::builder("my table").build();
    }

    #[test]
    fn app_entities_are_well_formed() {
        let defs = waveline_entities();
        assert_eq!(defs.len(), 5);
        for def in &defs {
            assert!(name_regex().is_match(&def.name));
        }
    }
}
