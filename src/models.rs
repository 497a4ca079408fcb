use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use validator::Validate;

/// Missing keys default to empty so that length rules report on them too.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct LookupQuery {
    #[validate(length(min = 1, max = 80))]
    pub word: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Validate)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ConnotationQuery {
    #[validate(length(min = 1, max = 80))]
    pub headword: String,
    #[validate(length(min = 1, max = 80))]
    pub synonym: String,
    #[validate(length(min = 1, max = 40))]
    pub part_of_speech: String,
    #[validate(length(min = 1, max = 400))]
    pub definition: String,
}

/// English text with a best-effort Simplified Chinese gloss.
///
/// Completions produced from older prompt shapes sometimes carry a bare
/// string where an object is expected; that string becomes `en`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BilingualText {
    pub en: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zh: Option<String>,
}

impl<'de> Deserialize<'de> for BilingualText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Object {
            en: String,
            #[serde(default)]
            zh: Option<String>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            Object(Object),
            Bare(String),
        }

        match Shape::deserialize(deserializer) {
            Ok(Shape::Object(obj)) => Ok(Self {
                en: obj.en,
                zh: obj.zh,
            }),
            Ok(Shape::Bare(en)) => Ok(Self { en, zh: None }),
            Err(_) => Err(serde::de::Error::custom(
                "expected a string or an object with a string `en` field",
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct SynonymResponse {
    pub word: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phonetics: Option<Vec<String>>,
    pub items: Vec<SynonymItem>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynonymItem {
    pub part_of_speech: String,
    pub meanings: Vec<Meaning>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meaning {
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<BilingualText>,
    pub synonyms: Vec<BilingualText>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
    Neutral,
    Mixed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Register {
    Formal,
    Neutral,
    Informal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConnotationResponse {
    pub headword: String,
    pub synonym: String,
    pub part_of_speech: String,
    pub definition: String,
    pub polarity: Polarity,
    pub register: Register,
    #[validate(length(min = 1, max = 6))]
    pub tone_tags: Vec<BilingualText>,
    pub usage_note: BilingualText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 4))]
    pub cautions: Option<Vec<BilingualText>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<BilingualText>,
}

/// One `{path, message}` entry of a 400 response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub path: String,
    pub message: String,
}

impl Issue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderPreferences>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningOptions>,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    JsonSchema { json_schema: JsonSchemaFormat },
}

#[derive(Debug, Serialize)]
pub struct JsonSchemaFormat {
    pub name: String,
    pub strict: bool,
    pub schema: Value,
}

/// OpenRouter provider routing.
#[derive(Debug, Serialize)]
pub struct ProviderPreferences {
    pub only: Vec<String>,
    pub allow_fallbacks: bool,
}

#[derive(Debug, Serialize)]
pub struct ReasoningOptions {
    pub effort: String,
    pub exclude: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletion {
    /// Text of the first choice, empty when the provider sent none.
    pub fn into_content(self) -> String {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default()
    }
}
