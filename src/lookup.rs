use serde_json::{json, Value};

use crate::config::{EndpointConfig, EndpointsConfig};
use crate::endpoint::{bilingual_schema, LlmEndpoint};
use crate::models::{ChatMessage, LookupQuery, SynonymResponse};

const SYSTEM_PROMPT: &str = "You are a meticulous bilingual lexicographer (English + Simplified Chinese). \
The user will provide a word. Provide an exhaustive analysis of it.
1. Output strictly valid JSON matching the provided schema, with no Markdown fences.
2. Include every definition: common, rare, archaic and technical.
3. For each definition give a unique example sentence with a natural Chinese translation in \"zh\".
4. For each definition give precise English synonyms, each with a short Chinese gloss in \"zh\".
5. If unsure of a Chinese rendering, omit \"zh\" for that entry.";

/// `GET /api/lookup?word=...`
pub struct Lookup;

impl LlmEndpoint for Lookup {
    type Query = LookupQuery;
    type Output = SynonymResponse;

    const LABEL: &'static str = "Lookup";
    const SCHEMA_NAME: &'static str = "synonym_lookup";
    const FIELDS: &'static [&'static str] = &["word"];

    fn settings(endpoints: &EndpointsConfig) -> &EndpointConfig {
        &endpoints.lookup
    }

    fn messages(query: &LookupQuery) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!("Define the word: \"{}\"", query.word)),
        ]
    }

    fn response_schema() -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "word": { "type": "string" },
                "phonetics": { "type": "array", "items": { "type": "string" } },
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {
                            "partOfSpeech": { "type": "string" },
                            "meanings": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "additionalProperties": false,
                                    "properties": {
                                        "definition": { "type": "string" },
                                        "example": bilingual_schema(),
                                        "synonyms": { "type": "array", "items": bilingual_schema() }
                                    },
                                    "required": ["definition", "synonyms"]
                                }
                            }
                        },
                        "required": ["partOfSpeech", "meanings"]
                    }
                }
            },
            "required": ["word", "items"]
        })
    }
}
