use std::collections::BTreeMap;
use std::path::Path;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::engagement::reward::DifficultyTier;

/// What was (or will be) delivered for one encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub text: String,
    pub theme: String,
    pub base_points: u32,
    pub difficulty: DifficultyTier,
}

pub trait ContentProvider: Send + Sync {
    /// `None` when none of the user's themes has anything to offer.
    fn select_content(&self, user_id: &str, themes: &[String]) -> Option<Content>;

    fn has_theme(&self, theme: &str) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub text: String,
    pub base_points: u32,
    #[serde(default)]
    pub difficulty: Option<DifficultyTier>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThemeCatalog {
    #[serde(default)]
    pub entries: Vec<CatalogEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("catalog is empty")]
    Empty,
}

/// In-memory catalog, keyed by theme name.
#[derive(Debug, Clone)]
pub struct StaticContentProvider {
    themes: BTreeMap<String, ThemeCatalog>,
}

impl StaticContentProvider {
    pub fn new(themes: BTreeMap<String, ThemeCatalog>) -> Result<Self, CatalogError> {
        if themes.values().all(|t| t.entries.is_empty()) {
            return Err(CatalogError::Empty);
        }
        Ok(Self { themes })
    }

    /// Load a JSON object of `{ "<theme>": { "entries": [...] } }`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        let themes: BTreeMap<String, ThemeCatalog> = serde_json::from_str(&raw)?;
        Self::new(themes)
    }

    pub fn builtin() -> Self {
        let entry = |text: &str, base_points: u32| CatalogEntry {
            text: text.to_string(),
            base_points,
            difficulty: None,
        };
        let mut themes = BTreeMap::new();
        themes.insert(
            "focus".to_string(),
            ThemeCatalog {
                entries: vec![
                    entry("I finish what I start.", 20),
                    entry("One task at a time, done well.", 40),
                    entry("Distraction passes; the work remains and so do I.", 80),
                ],
            },
        );
        themes.insert(
            "gratitude".to_string(),
            ThemeCatalog {
                entries: vec![
                    entry("Today I notice what is already good.", 30),
                    entry("I thank the people who make my days lighter.", 50),
                ],
            },
        );
        themes.insert(
            "resilience".to_string(),
            ThemeCatalog {
                entries: vec![
                    entry("Setbacks are information, not verdicts.", 60),
                    entry("I have come through harder days than this one and I will again.", 120),
                    entry(
                        "When every plan fails I still choose the next step, and then the one after it.",
                        160,
                    ),
                ],
            },
        );
        Self { themes }
    }

    pub fn theme_names(&self) -> Vec<String> {
        self.themes.keys().cloned().collect()
    }
}

impl ContentProvider for StaticContentProvider {
    fn select_content(&self, _user_id: &str, themes: &[String]) -> Option<Content> {
        let pool: Vec<(&str, &CatalogEntry)> = themes
            .iter()
            .filter_map(|name| self.themes.get_key_value(name))
            .flat_map(|(name, catalog)| catalog.entries.iter().map(move |e| (name.as_str(), e)))
            .collect();

        let (theme, entry) = pool.choose(&mut rand::thread_rng())?;
        Some(Content {
            text: entry.text.clone(),
            theme: (*theme).to_string(),
            base_points: entry.base_points,
            difficulty: entry
                .difficulty
                .unwrap_or_else(|| DifficultyTier::from_base_points(entry.base_points)),
        })
    }

    fn has_theme(&self, theme: &str) -> bool {
        self.themes.contains_key(theme)
    }
}
