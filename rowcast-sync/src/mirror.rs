//! Client-side replica of one topic, rebuilt from pushed events.
//!
//! A mirror starts empty and unloaded. `Loaded` replaces its contents and
//! sets its version; every later mutation must carry exactly the next
//! version, otherwise the mirror refuses it and the caller should `Load`
//! again.

use thiserror::Error;

use crate::entity::Entity;
use crate::protocol::ChangeEvent;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MirrorError {
    #[error("mutation v{0} arrived before any Loaded")]
    NotLoaded(u64),

    #[error("version gap: expected v{expected}, received v{received}")]
    Gap { expected: u64, received: u64 },

    #[error("stale event v{received} (mirror at v{current})")]
    Stale { current: u64, received: u64 },
}

/// Ordered local copy of a topic's rows.
#[derive(Debug, Clone)]
pub struct TopicMirror<T: Entity> {
    items: Vec<T>,
    version: Option<u64>,
    total_count: Option<u64>,
}

impl<T: Entity> Default for TopicMirror<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> TopicMirror<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            version: None,
            total_count: None,
        }
    }

    /// Apply one event pushed at `version`.
    ///
    /// Updates and removals for rows outside the loaded page still advance
    /// the version.
    pub fn apply(&mut self, version: u64, event: &ChangeEvent<T>) -> Result<(), MirrorError> {
        if let ChangeEvent::Loaded { items, total_count } = event {
            self.items = items.clone();
            self.total_count = *total_count;
            self.version = Some(version);
            return Ok(());
        }

        let current = self.version.ok_or(MirrorError::NotLoaded(version))?;
        if version <= current {
            return Err(MirrorError::Stale {
                current,
                received: version,
            });
        }
        if version != current + 1 {
            return Err(MirrorError::Gap {
                expected: current + 1,
                received: version,
            });
        }

        match event {
            ChangeEvent::Added(item) => match self.position(item.key().as_ref()) {
                Some(i) => self.items[i] = item.clone(),
                None => self.items.push(item.clone()),
            },
            ChangeEvent::Updated { key, patch } => {
                if let Some(i) = self.position(Some(key)) {
                    self.items[i].apply_patch(patch);
                }
            }
            ChangeEvent::Removed(key) => {
                if let Some(i) = self.position(Some(key)) {
                    self.items.remove(i);
                }
            }
            ChangeEvent::Loaded { .. } => {}
        }
        self.version = Some(version);
        Ok(())
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.position(Some(key)).map(|i| &self.items[i])
    }

    /// Version of the last applied event; `None` until loaded.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Total count reported by the last `Loaded`, if requested.
    pub fn total_count(&self) -> Option<u64> {
        self.total_count
    }

    pub fn is_loaded(&self) -> bool {
        self.version.is_some()
    }

    fn position(&self, key: Option<&T::Key>) -> Option<usize> {
        let key = key?;
        self.items
            .iter()
            .position(|item| item.key().as_ref() == Some(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Article, ArticlePatch};

    fn article(id: u64, name: &str) -> Article {
        let mut a = Article::new(name, 1.0);
        a.id = Some(id);
        a
    }

    fn loaded(items: Vec<Article>) -> ChangeEvent<Article> {
        ChangeEvent::Loaded {
            items,
            total_count: None,
        }
    }

    #[test]
    fn test_rebuild_from_events() {
        let mut mirror = TopicMirror::new();
        mirror.apply(0, &loaded(vec![])).unwrap();
        mirror
            .apply(1, &ChangeEvent::Added(article(1, "Ring A")))
            .unwrap();
        mirror
            .apply(2, &ChangeEvent::Added(article(2, "Ring B")))
            .unwrap();
        mirror
            .apply(
                3,
                &ChangeEvent::Updated {
                    key: 1,
                    patch: ArticlePatch::name("Ring A2"),
                },
            )
            .unwrap();
        mirror.apply(4, &ChangeEvent::Removed(2)).unwrap();

        assert_eq!(mirror.items(), &[article(1, "Ring A2")]);
        assert_eq!(mirror.version(), Some(4));
        assert_eq!(mirror.get(&1).map(|a| a.name.as_str()), Some("Ring A2"));
    }

    #[test]
    fn test_mutation_before_loaded() {
        let mut mirror: TopicMirror<Article> = TopicMirror::new();
        assert_eq!(
            mirror.apply(1, &ChangeEvent::Removed(1)),
            Err(MirrorError::NotLoaded(1))
        );
        assert!(!mirror.is_loaded());
    }

    #[test]
    fn test_gap_and_stale_detection() {
        let mut mirror = TopicMirror::new();
        mirror.apply(5, &loaded(vec![article(1, "a")])).unwrap();

        assert_eq!(
            mirror.apply(7, &ChangeEvent::Removed(1)),
            Err(MirrorError::Gap {
                expected: 6,
                received: 7
            })
        );
        assert_eq!(
            mirror.apply(5, &ChangeEvent::Removed(1)),
            Err(MirrorError::Stale {
                current: 5,
                received: 5
            })
        );
        // Refused events leave the mirror untouched.
        assert_eq!(mirror.items().len(), 1);
        assert_eq!(mirror.version(), Some(5));
    }

    #[test]
    fn test_events_outside_page_advance_version() {
        let mut mirror = TopicMirror::new();
        mirror.apply(0, &loaded(vec![article(1, "a")])).unwrap();
        mirror.apply(1, &ChangeEvent::Removed(99)).unwrap();
        assert_eq!(mirror.items().len(), 1);
        assert_eq!(mirror.version(), Some(1));
    }

    #[test]
    fn test_reload_replaces_contents() {
        let mut mirror = TopicMirror::new();
        mirror.apply(0, &loaded(vec![article(1, "a")])).unwrap();
        mirror
            .apply(
                9,
                &ChangeEvent::Loaded {
                    items: vec![article(2, "b")],
                    total_count: Some(40),
                },
            )
            .unwrap();
        assert_eq!(mirror.items(), &[article(2, "b")]);
        assert_eq!(mirror.total_count(), Some(40));
        assert_eq!(mirror.version(), Some(9));
    }
}
