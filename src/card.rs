//! The character-card document model.
//!
//! A card is a JSON document embedded in the image. The engine only
//! understands the handful of textual fields it translates; everything else
//! is carried through untouched so that re-embedding is lossless.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The embedded metadata document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterCard {
    #[serde(default)]
    pub data: CardData,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The translatable payload of a card.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_mes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mes_example: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate_greetings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_book: Option<CharacterBook>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Optional lore-book attached to a card.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterBook {
    #[serde(default)]
    pub entries: Vec<BookEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookEntry {
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The closed set of translatable field kinds.
///
/// Prompt selection is resolved through this enum rather than by field-name
/// strings, so an unknown field can never pick a prompt at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Description,
    Personality,
    Scenario,
    FirstMes,
    MesExample,
    SystemPrompt,
    AlternateGreeting,
    /// Character-book entry content and anything else: the default bucket.
    BookContent,
}

impl FieldKind {
    /// The six scalar card fields, in the order the driver walks them.
    pub const SCALARS: [FieldKind; 6] = [
        FieldKind::Description,
        FieldKind::Personality,
        FieldKind::Scenario,
        FieldKind::FirstMes,
        FieldKind::MesExample,
        FieldKind::SystemPrompt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Description => "description",
            Self::Personality => "personality",
            Self::Scenario => "scenario",
            Self::FirstMes => "first_mes",
            Self::MesExample => "mes_example",
            Self::SystemPrompt => "system_prompt",
            Self::AlternateGreeting => "alternate_greetings",
            Self::BookContent => "character_book.content",
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The system prompts used for translation, treated as opaque strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptSet {
    /// Prompt for the character description.
    pub description: String,
    /// Prompt for conversational text: greetings and example dialogue.
    pub dialogue: String,
    /// Prompt for everything else.
    pub base: String,
}

impl PromptSet {
    /// Picks the system prompt for a field kind.
    pub fn resolve(&self, kind: FieldKind) -> &str {
        match kind {
            FieldKind::Description => &self.description,
            FieldKind::FirstMes | FieldKind::MesExample | FieldKind::AlternateGreeting => {
                &self.dialogue
            }
            _ => &self.base,
        }
    }
}

impl CardData {
    /// Reads a scalar field, if present.
    pub fn scalar(&self, kind: FieldKind) -> Option<&str> {
        match kind {
            FieldKind::Description => self.description.as_deref(),
            FieldKind::Personality => self.personality.as_deref(),
            FieldKind::Scenario => self.scenario.as_deref(),
            FieldKind::FirstMes => self.first_mes.as_deref(),
            FieldKind::MesExample => self.mes_example.as_deref(),
            FieldKind::SystemPrompt => self.system_prompt.as_deref(),
            FieldKind::AlternateGreeting | FieldKind::BookContent => None,
        }
    }

    /// Replaces a scalar field. Only fields already present are written.
    pub fn set_scalar(&mut self, kind: FieldKind, value: String) {
        let slot = match kind {
            FieldKind::Description => &mut self.description,
            FieldKind::Personality => &mut self.personality,
            FieldKind::Scenario => &mut self.scenario,
            FieldKind::FirstMes => &mut self.first_mes,
            FieldKind::MesExample => &mut self.mes_example,
            FieldKind::SystemPrompt => &mut self.system_prompt,
            FieldKind::AlternateGreeting | FieldKind::BookContent => return,
        };
        if slot.is_some() {
            *slot = Some(value);
        }
    }
}
