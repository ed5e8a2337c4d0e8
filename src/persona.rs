//! Persona definitions and catalog
//!
//! A persona is a JSON document (`<id>.json`) naming the character, its base
//! instructions, the synthesis voice, and optional modifiers for the
//! heightened mode. Files in the personas directory override the embedded
//! defaults of the same id.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Modifier appended in heightened mode when the persona doesn't define one
pub const DEFAULT_HEIGHTENED_MODIFIERS: &str = "Turn the intensity up. Be bolder, \
    more irreverent and more emotionally expressive than usual, while staying in character.";

/// Embedded default persona data
const EMBEDDED_PERSONAS: &[(&str, &str)] = &[
    ("companion", include_str!("../personas/companion.json")),
    ("coach", include_str!("../personas/coach.json")),
];

/// Behavioural variant requested for a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonaMode {
    #[default]
    Standard,
    Heightened,
}

impl PersonaMode {
    /// Parse a boolean-as-string flag (`"true"` or `"1"` selects heightened)
    #[must_use]
    pub fn from_flag(flag: &str) -> Self {
        let flag = flag.trim();
        if flag == "1" || flag.eq_ignore_ascii_case("true") {
            Self::Heightened
        } else {
            Self::Standard
        }
    }

    /// Wire form of the flag
    #[must_use]
    pub const fn as_flag(self) -> &'static str {
        match self {
            Self::Standard => "false",
            Self::Heightened => "true",
        }
    }

    #[must_use]
    pub const fn is_heightened(self) -> bool {
        matches!(self, Self::Heightened)
    }
}

/// A character the user can talk to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    /// Unique identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Base system instructions
    pub instructions: String,

    /// Synthesis voice identifier
    #[serde(default)]
    pub voice: Option<String>,

    /// Language hint for transcription (ISO 639-1)
    #[serde(default)]
    pub language: Option<String>,

    /// Extra behaviour appended in heightened mode
    #[serde(default)]
    pub heightened_modifiers: Option<String>,
}

impl Persona {
    /// System instructions for the given mode
    ///
    /// Heightened modifiers are appended after the base instructions, never
    /// in place of them.
    #[must_use]
    pub fn instructions_for(&self, mode: PersonaMode) -> String {
        match mode {
            PersonaMode::Standard => self.instructions.clone(),
            PersonaMode::Heightened => {
                let modifiers = self
                    .heightened_modifiers
                    .as_deref()
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or(DEFAULT_HEIGHTENED_MODIFIERS);
                format!("{}\n\n{modifiers}", self.instructions)
            }
        }
    }

    /// Voice to synthesize with, falling back to `default`
    #[must_use]
    pub fn voice_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.voice.as_deref().unwrap_or(default)
    }

    /// Language hint, falling back to `default`
    #[must_use]
    pub fn language_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.language.as_deref().unwrap_or(default)
    }
}

/// Personas available to the server, keyed by id
#[derive(Debug, Clone, Default)]
pub struct PersonaCatalog {
    personas: BTreeMap<String, Persona>,
}

impl PersonaCatalog {
    /// Catalog of the embedded personas
    #[must_use]
    pub fn builtin() -> Self {
        let mut catalog = Self::default();

        for (id, json) in EMBEDDED_PERSONAS {
            match serde_json::from_str::<Persona>(json) {
                Ok(persona) => catalog.insert(persona),
                Err(e) => tracing::warn!(persona_id = id, error = %e, "invalid embedded persona"),
            }
        }

        catalog
    }

    /// Embedded personas overlaid with every `*.json` file in `dir`
    ///
    /// # Errors
    ///
    /// Returns error if the directory can't be read or a file fails to parse
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let mut catalog = Self::builtin();

        let Some(dir) = dir else {
            return Ok(catalog);
        };

        if !dir.exists() {
            tracing::warn!(
                path = %dir.display(),
                "personas directory not found, using embedded personas"
            );
            return Ok(catalog);
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let content = std::fs::read_to_string(&path)?;
            let persona: Persona = serde_json::from_str(&content).map_err(|e| {
                Error::Config(format!("failed to parse {}: {e}", path.display()))
            })?;

            tracing::debug!(persona_id = %persona.id, path = %path.display(), "loaded persona");
            catalog.insert(persona);
        }

        tracing::info!(count = catalog.len(), "persona catalog ready");
        Ok(catalog)
    }

    /// Add or replace a persona
    pub fn insert(&mut self, persona: Persona) {
        self.personas.insert(persona.id.clone(), persona);
    }

    /// Look up a persona
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id
    pub fn get(&self, id: &str) -> Result<&Persona> {
        self.personas
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("persona '{id}'")))
    }

    /// All personas in id order
    pub fn iter(&self) -> impl Iterator<Item = &Persona> {
        self.personas.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.personas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona(modifiers: Option<&str>) -> Persona {
        Persona {
            id: "P1".to_string(),
            name: "Test".to_string(),
            instructions: "Be kind.".to_string(),
            voice: None,
            language: None,
            heightened_modifiers: modifiers.map(String::from),
        }
    }

    #[test]
    fn test_mode_flag_parsing() {
        assert_eq!(PersonaMode::from_flag("true"), PersonaMode::Heightened);
        assert_eq!(PersonaMode::from_flag("TRUE"), PersonaMode::Heightened);
        assert_eq!(PersonaMode::from_flag("1"), PersonaMode::Heightened);
        assert_eq!(PersonaMode::from_flag("false"), PersonaMode::Standard);
        assert_eq!(PersonaMode::from_flag(""), PersonaMode::Standard);
        assert_eq!(PersonaMode::from_flag("yes"), PersonaMode::Standard);
    }

    #[test]
    fn test_heightened_appends_modifiers() {
        let p = persona(Some("Be loud."));
        assert_eq!(p.instructions_for(PersonaMode::Standard), "Be kind.");

        let heightened = p.instructions_for(PersonaMode::Heightened);
        assert!(heightened.starts_with("Be kind."));
        assert!(heightened.ends_with("Be loud."));
    }

    #[test]
    fn test_heightened_default_modifiers() {
        let heightened = persona(None).instructions_for(PersonaMode::Heightened);
        assert!(heightened.starts_with("Be kind."));
        assert!(heightened.contains(DEFAULT_HEIGHTENED_MODIFIERS));
    }

    #[test]
    fn test_builtin_personas_parse() {
        let catalog = PersonaCatalog::builtin();
        assert_eq!(catalog.len(), EMBEDDED_PERSONAS.len());
        assert_eq!(catalog.get("coach").unwrap().voice_or("alloy"), "nova");
        assert!(matches!(catalog.get("nobody"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_directory_overrides_embedded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("coach.json"),
            r#"{"id":"coach","name":"Other","instructions":"Shout."}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = PersonaCatalog::load(Some(dir.path())).unwrap();
        let coach = catalog.get("coach").unwrap();
        assert_eq!(coach.name, "Other");
        assert_eq!(coach.voice_or("alloy"), "alloy");
        assert!(catalog.get("companion").is_ok());
    }
}
