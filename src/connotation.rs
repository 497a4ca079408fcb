use serde_json::{json, Value};

use crate::config::{EndpointConfig, EndpointsConfig};
use crate::endpoint::{bilingual_schema, LlmEndpoint};
use crate::models::{ChatMessage, ConnotationQuery, ConnotationResponse};

const SYSTEM_PROMPT: &str = "You are a bilingual (English + Simplified Chinese) writing coach and lexicographer.
Task: given a headword sense and ONE candidate synonym, produce compact connotation guidance to help a writer choose the best word.
Rules:
1) Keep it short (UI tooltip). Prefer 1-2 sentences per field.
2) Provide natural Chinese; if unsure, omit \"zh\" for that field.
3) Return 2-5 toneTags. Return 0-3 cautions.";

/// `GET /api/connotation?headword=&synonym=&partOfSpeech=&definition=`
pub struct Connotation;

impl LlmEndpoint for Connotation {
    type Query = ConnotationQuery;
    type Output = ConnotationResponse;

    const LABEL: &'static str = "Connotation";
    const SCHEMA_NAME: &'static str = "connotation";
    const FIELDS: &'static [&'static str] = &["headword", "synonym", "partOfSpeech", "definition"];

    fn settings(endpoints: &EndpointsConfig) -> &EndpointConfig {
        &endpoints.connotation
    }

    fn messages(query: &ConnotationQuery) -> Vec<ChatMessage> {
        let user = format!(
            "Headword: {}\nPart of speech: {}\nSense definition: {}\nCandidate synonym: {}\n\n\
             Explain how \"{}\" differs in connotation from other near-synonyms in THIS sense.",
            query.headword, query.part_of_speech, query.definition, query.synonym, query.synonym
        );
        vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
    }

    fn response_schema() -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "headword": { "type": "string" },
                "synonym": { "type": "string" },
                "partOfSpeech": { "type": "string" },
                "definition": { "type": "string" },
                "polarity": { "type": "string", "enum": ["positive", "negative", "neutral", "mixed"] },
                "register": { "type": "string", "enum": ["formal", "neutral", "informal"] },
                "toneTags": { "type": "array", "minItems": 1, "maxItems": 6, "items": bilingual_schema() },
                "usageNote": bilingual_schema(),
                "cautions": { "type": "array", "maxItems": 4, "items": bilingual_schema() },
                "example": bilingual_schema()
            },
            "required": [
                "headword",
                "synonym",
                "partOfSpeech",
                "definition",
                "polarity",
                "register",
                "toneTags",
                "usageNote"
            ]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> ConnotationQuery {
        ConnotationQuery {
            headword: "happy".to_string(),
            synonym: "elated".to_string(),
            part_of_speech: "adjective".to_string(),
            definition: "feeling or showing pleasure".to_string(),
        }
    }

    #[test]
    fn prompt_names_every_query_field() {
        let messages = Connotation::messages(&query());
        assert_eq!(messages.len(), 2);
        let user = &messages[1].content;
        assert!(user.contains("Headword: happy"));
        assert!(user.contains("Part of speech: adjective"));
        assert!(user.contains("Sense definition: feeling or showing pleasure"));
        assert!(user.contains("\"elated\" differs"));
    }

    #[test]
    fn schema_bounds_tone_tags_and_cautions() {
        let schema = Connotation::response_schema();
        assert_eq!(schema["properties"]["toneTags"]["minItems"], 1);
        assert_eq!(schema["properties"]["toneTags"]["maxItems"], 6);
        assert_eq!(schema["properties"]["cautions"]["maxItems"], 4);
    }

    #[test]
    fn seven_tone_tags_are_rejected() {
        let tags: Vec<Value> = (0..7).map(|i| json!({"en": format!("tag{i}")})).collect();
        let value = json!({
            "headword": "happy",
            "synonym": "elated",
            "partOfSpeech": "adjective",
            "definition": "feeling or showing pleasure",
            "polarity": "positive",
            "register": "informal",
            "toneTags": tags,
            "usageNote": {"en": "Stronger than happy."}
        });
        let err = Connotation::validate(value).expect_err("too many tags");
        assert!(err.message.contains("at most 6"));
    }
}
