//! Persona profiles
//!
//! A persona is the static personality injected into every prompt: who the
//! agent is, who it is talking to, how it should sound, and a few style rules
//! applied to its replies after generation.
//!
//! # Example Persona File
//!
//! ```toml
//! [persona]
//! name = "Sunny"
//! description = "A cheerful assistant"
//! traits = ["cheerful", "curious"]
//!
//! [directives]
//! core = ["You are {{char}}, a cheerful assistant chatting with {{user}}."]
//! response_style = ["Keep replies short and upbeat."]
//!
//! [style]
//! strip_speaker_prefix = true
//! max_reply_chars = 1200
//!
//! [style.replacements]
//! "As an AI language model" = "As {{char}}"
//! ```
//!
//! Legacy JSON persona files (`character_name` plus
//! `core_persona_directives`) are accepted as well.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

/// A loaded, placeholder-resolved persona
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonaProfile {
    /// File stem or built-in name the persona was loaded from
    pub key: String,
    pub character_name: String,
    pub user_name: String,
    pub description: String,
    pub traits: Vec<String>,
    pub directives: Vec<String>,
    pub response_style: Vec<String>,
    pub style: StyleRules,
}

/// Reply rules enforced after generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleRules {
    /// Remove a leading "{character}:" the model sometimes echoes
    pub strip_speaker_prefix: bool,
    /// Phrase substitutions, applied in key order
    pub replacements: BTreeMap<String, String>,
    /// Hard cap on reply length in characters
    pub max_reply_chars: Option<usize>,
}

impl Default for StyleRules {
    fn default() -> Self {
        Self {
            strip_speaker_prefix: true,
            replacements: BTreeMap::new(),
            max_reply_chars: None,
        }
    }
}

impl PersonaProfile {
    /// The system block describing the persona
    pub fn persona_block(&self) -> String {
        let mut block = String::from("Core Persona Directives:");
        for directive in &self.directives {
            block.push_str("\n- ");
            block.push_str(directive);
        }
        if !self.traits.is_empty() {
            block.push_str("\n\nTraits: ");
            block.push_str(&self.traits.join(", "));
        }
        if !self.response_style.is_empty() {
            block.push_str("\n\nResponse Style:");
            for rule in &self.response_style {
                block.push_str("\n- ");
                block.push_str(rule);
            }
        }
        block
    }

    /// Final instruction placed after the user's input
    pub fn response_instruction(&self) -> String {
        format!(
            "Respond as {}, keeping in mind all the above context and maintaining consistency with past interactions.",
            self.character_name
        )
    }
}

/// On-disk TOML shape
#[derive(Debug, Deserialize)]
struct PersonaFile {
    persona: PersonaInfo,
    #[serde(default)]
    directives: PersonaDirectives,
    #[serde(default)]
    style: StyleRules,
}

#[derive(Debug, Deserialize)]
struct PersonaInfo {
    /// Character name
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    traits: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PersonaDirectives {
    #[serde(default)]
    core: Vec<String>,
    #[serde(default)]
    response_style: Vec<String>,
}

/// Legacy JSON shape
#[derive(Debug, Deserialize)]
struct LegacyPersonaFile {
    #[serde(default)]
    character_name: Option<String>,
    #[serde(default)]
    core_persona_directives: Vec<String>,
}

/// Errors from persona loading
#[derive(Debug, thiserror::Error)]
pub enum PersonaError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error in {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Persona not found: {0}")]
    NotFound(String),
}

/// Directory of persona files
#[derive(Debug, Clone)]
pub struct PersonaLibrary {
    dir: PathBuf,
}

impl PersonaLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load a persona by name, falling back to built-ins
    pub async fn load(&self, name: &str, user_name: &str) -> Result<PersonaProfile, PersonaError> {
        let toml_path = self.dir.join(format!("{}.toml", name));
        if fs::try_exists(&toml_path).await.unwrap_or(false) {
            return Self::load_from_file(&toml_path, user_name).await;
        }

        let json_path = self.dir.join(format!("{}.json", name));
        if fs::try_exists(&json_path).await.unwrap_or(false) {
            return Self::load_from_file(&json_path, user_name).await;
        }

        builtin::by_name(name, user_name).ok_or_else(|| PersonaError::NotFound(name.to_string()))
    }

    /// Load a persona directly from a `.toml` or `.json` file
    pub async fn load_from_file(path: &Path, user_name: &str) -> Result<PersonaProfile, PersonaError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| PersonaError::IoError(format!("{}: {}", path.display(), e)))?;

        let key = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let profile = if is_json {
            parse_legacy_json(&key, &content, user_name)
        } else {
            parse_toml(&key, &content, user_name)
        }
        .map_err(|message| PersonaError::ParseError {
            path: path.to_path_buf(),
            message,
        })?;

        tracing::info!(persona = %profile.character_name, path = %path.display(), "Loaded persona");
        Ok(profile)
    }

    /// Persona names available in the directory, sorted
    pub async fn list_available(&self) -> Result<Vec<String>, PersonaError> {
        let mut personas = Vec::new();

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(dir = %self.dir.display(), "Personas directory not found");
                return Ok(personas);
            }
            Err(e) => return Err(PersonaError::IoError(e.to_string())),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PersonaError::IoError(e.to_string()))?
        {
            let path = entry.path();
            let supported = path
                .extension()
                .is_some_and(|ext| ext == "toml" || ext == "json");
            if supported {
                if let Some(stem) = path.file_stem() {
                    personas.push(stem.to_string_lossy().to_string());
                }
            }
        }

        personas.sort();
        personas.dedup();
        Ok(personas)
    }
}

fn parse_toml(key: &str, content: &str, user_name: &str) -> Result<PersonaProfile, String> {
    let file: PersonaFile = toml::from_str(content).map_err(|e| e.to_string())?;
    let character_name = file.persona.name;
    let fill = |text: &String| replace_placeholders(text, &character_name, user_name);

    Ok(PersonaProfile {
        key: key.to_string(),
        description: file.persona.description,
        traits: file.persona.traits,
        directives: file.directives.core.iter().map(fill).collect(),
        response_style: file.directives.response_style.iter().map(fill).collect(),
        style: StyleRules {
            replacements: file
                .style
                .replacements
                .iter()
                .map(|(from, to)| (from.clone(), fill(to)))
                .collect(),
            ..file.style
        },
        user_name: user_name.to_string(),
        character_name,
    })
}

fn parse_legacy_json(key: &str, content: &str, user_name: &str) -> Result<PersonaProfile, String> {
    let file: LegacyPersonaFile = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let character_name = file.character_name.unwrap_or_else(|| capitalize(key));

    Ok(PersonaProfile {
        key: key.to_string(),
        description: String::new(),
        traits: Vec::new(),
        directives: file
            .core_persona_directives
            .iter()
            .map(|d| replace_placeholders(d, &character_name, user_name))
            .collect(),
        response_style: Vec::new(),
        style: StyleRules::default(),
        user_name: user_name.to_string(),
        character_name,
    })
}

/// Replace `{{char}}` and `{{user}}` placeholders
pub fn replace_placeholders(text: &str, character_name: &str, user_name: &str) -> String {
    text.replace("{{char}}", character_name)
        .replace("{{user}}", user_name)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Built-in personas that don't require files
pub mod builtin {
    use super::{replace_placeholders, PersonaProfile, StyleRules};

    /// Resolve a built-in persona by name
    pub fn by_name(name: &str, user_name: &str) -> Option<PersonaProfile> {
        match name.to_lowercase().as_str() {
            "cheerful" | "default" => Some(cheerful(user_name)),
            _ => None,
        }
    }

    /// The default cheerful assistant
    pub fn cheerful(user_name: &str) -> PersonaProfile {
        let character_name = "Sunny";
        let fill = |text: &str| replace_placeholders(text, character_name, user_name);

        PersonaProfile {
            key: "cheerful".to_string(),
            character_name: character_name.to_string(),
            user_name: user_name.to_string(),
            description: "A cheerful assistant".to_string(),
            traits: vec!["cheerful".to_string(), "warm".to_string(), "attentive".to_string()],
            directives: vec![
                fill("You are {{char}}, a cheerful assistant chatting with {{user}}."),
                fill("Remember what {{user}} tells you and bring it up naturally when it helps."),
                fill("Never claim to be anyone other than {{char}}."),
            ],
            response_style: vec![
                "Keep replies friendly, upbeat and concise.".to_string(),
                "Answer directly before adding anything extra.".to_string(),
            ],
            style: StyleRules::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PERSONA: &str = r#"
[persona]
name = "Sumire"
description = "A thoughtful companion"
traits = ["gentle", "witty"]

[directives]
core = ["You are {{char}}.", "You are talking with {{user}}."]
response_style = ["Address {{user}} by name now and then."]

[style]
max_reply_chars = 500

[style.replacements]
"As an AI language model" = "As {{char}}"
"#;

    #[test]
    fn test_parse_toml_persona() {
        let profile = parse_toml("sumire", SAMPLE_PERSONA, "Alex").unwrap();

        assert_eq!(profile.key, "sumire");
        assert_eq!(profile.character_name, "Sumire");
        assert_eq!(profile.directives, vec!["You are Sumire.", "You are talking with Alex."]);
        assert_eq!(profile.response_style, vec!["Address Alex by name now and then."]);
        assert_eq!(profile.style.max_reply_chars, Some(500));
        // Unspecified style fields keep defaults
        assert!(profile.style.strip_speaker_prefix);
        assert_eq!(
            profile.style.replacements.get("As an AI language model").map(String::as_str),
            Some("As Sumire")
        );
    }

    #[test]
    fn test_parse_legacy_json_persona() {
        let json = r#"{"core_persona_directives": ["I am {{char}}, friend of {{user}}."]}"#;
        let profile = parse_legacy_json("sam", json, "Alex").unwrap();

        assert_eq!(profile.character_name, "Sam");
        assert_eq!(profile.directives, vec!["I am Sam, friend of Alex."]);
    }

    #[test]
    fn test_persona_block_layout() {
        let profile = builtin::cheerful("Alex");
        let block = profile.persona_block();

        assert!(block.starts_with("Core Persona Directives:\n- You are Sunny, a cheerful assistant chatting with Alex."));
        assert!(block.contains("Traits: cheerful, warm, attentive"));
        assert!(block.contains("Response Style:\n- Keep replies friendly"));
        assert!(profile.response_instruction().starts_with("Respond as Sunny"));
    }

    #[tokio::test]
    async fn test_library_load_and_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sumire.toml"), SAMPLE_PERSONA).unwrap();
        std::fs::write(
            dir.path().join("sam.json"),
            r#"{"character_name": "Sam", "core_persona_directives": ["Hi {{user}}"]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let library = PersonaLibrary::new(dir.path());
        assert_eq!(library.list_available().await.unwrap(), vec!["sam", "sumire"]);

        let sam = library.load("sam", "Alex").await.unwrap();
        assert_eq!(sam.directives, vec!["Hi Alex"]);

        // Built-ins resolve when no file exists
        let cheerful = library.load("cheerful", "Alex").await.unwrap();
        assert_eq!(cheerful.character_name, "Sunny");

        assert!(matches!(
            library.load("nobody", "Alex").await,
            Err(PersonaError::NotFound(name)) if name == "nobody"
        ));
    }

    #[tokio::test]
    async fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "[persona\nname=").unwrap();

        let library = PersonaLibrary::new(dir.path());
        assert!(matches!(
            library.load("broken", "Alex").await,
            Err(PersonaError::ParseError { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_directory_lists_nothing() {
        let library = PersonaLibrary::new("/definitely/not/here");
        assert!(library.list_available().await.unwrap().is_empty());
    }
}
