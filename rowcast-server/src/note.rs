//! The demo row type served by the binary.

use rowcast_sync::{Entity, FieldDef, FieldType, Schema, Value};
use serde::{Deserialize, Serialize};

const MAX_TITLE_LEN: usize = 200;

static NOTE_SCHEMA: Schema = Schema::new(&[
    FieldDef::new("id", FieldType::Int),
    FieldDef::new("title", FieldType::Text),
    FieldDef::nullable("body", FieldType::Text),
    FieldDef::new("pinned", FieldType::Bool),
    FieldDef::new("priority", FieldType::Int),
]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: Option<u64>,
    pub title: String,
    pub body: Option<String>,
    pub pinned: bool,
    pub priority: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotePatch {
    pub title: Option<String>,
    pub body: Option<Option<String>>,
    pub pinned: Option<bool>,
    pub priority: Option<i64>,
}

impl Entity for Note {
    type Key = u64;
    type Patch = NotePatch;

    fn schema() -> &'static Schema {
        &NOTE_SCHEMA
    }

    fn key(&self) -> Option<u64> {
        self.id
    }

    fn set_key(&mut self, key: u64) {
        self.id = Some(key);
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.into()),
            "title" => Some(self.title.as_str().into()),
            "body" => Some(self.body.clone().into()),
            "pinned" => Some(self.pinned.into()),
            "priority" => Some(self.priority.into()),
            _ => None,
        }
    }

    fn apply_patch(&mut self, patch: &NotePatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(body) = &patch.body {
            self.body = body.clone();
        }
        if let Some(pinned) = patch.pinned {
            self.pinned = pinned;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
    }
}

/// Store-side constraint: titles are non-empty and bounded.
pub fn validate(note: &Note) -> Result<(), String> {
    let title = note.title.trim();
    if title.is_empty() {
        return Err("title must not be empty".to_string());
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(format!("title exceeds {MAX_TITLE_LEN} bytes"));
    }
    Ok(())
}
