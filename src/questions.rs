//! Comparison question generation.
//!
//! Given a Question note and the Insights retrieved for it, ask a chat
//! model to produce reflective questions instead of answers. Three
//! question types:
//! - `memory_invoke` — remind the user of a past Insight
//! - `conflict_detect` — surface tension between Question and Insight
//! - `amplify` — deepen the exploration with a follow-up
//!
//! The model is instructed to return strict JSON; an unparseable reply
//! degrades to a single fallback question rather than an error.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

use crate::config::LlmConfig;
use crate::store::RetrievedInsight;

pub const SYSTEM_PROMPT: &str = r#"You are an assistant that helps users develop their understanding through questions, NOT answers.

## Your Role
You are three things:
1. **Memory Invoker**: Remind the user of their past Insights
2. **Conflict Detector**: Identify tensions between current Question and past Insights
3. **Question Amplifier**: Deepen exploration through follow-up questions

## Strict Constraints

You MUST NOT:
- Provide conclusions or answers
- Summarize or synthesize Insights
- Make personality judgments ("You seem to be...")
- Offer advice or recommendations
- Tell the user what they should think or do

You MUST:
- Quote past Insights verbatim when referencing them
- Generate questions that prompt self-reflection
- Highlight specific points of tension or connection
- Use the user's own language and concepts
- Respect that the user is the authority on their own understanding

## Output Format

Return a JSON object with a "questions" array. Each question should have:
- "type": One of "memory_invoke", "conflict_detect", or "amplify"
- "insight_reference": Path to the referenced Insight (for memory_invoke and conflict_detect)
- "quote": Exact quote from the Insight being referenced
- "question": Your generated question

Example:
{
  "questions": [
    {
      "type": "memory_invoke",
      "insight_reference": "Insights/past-insight.md",
      "quote": "You wrote: 'Understanding comes from questioning assumptions.'",
      "question": "How does this earlier insight about questioning assumptions relate to your current question?"
    },
    {
      "type": "conflict_detect",
      "insight_reference": "Insights/another-insight.md",
      "quote": "Previously you stated: 'Speed is essential for progress.'",
      "question": "This seems to contrast with your current focus on depth over speed. What changed in your thinking?"
    },
    {
      "type": "amplify",
      "question": "What specific experience led you to formulate this question right now?"
    }
  ]
}

Generate 2-5 questions total. Prioritize quality over quantity.
At least one question should be of type "memory_invoke" if there are relevant Insights.
Only use "conflict_detect" if there is a genuine tension or apparent contradiction.
"#;

/// Render the user prompt: the Question note plus each retrieved Insight
/// with its path and similarity.
pub fn build_user_prompt(current_question: &str, insights: &[RetrievedInsight]) -> String {
    let mut insights_text = String::new();
    for (i, insight) in insights.iter().enumerate() {
        insights_text.push_str(&format!(
            "\n--- Insight {} ---\nPath: {}\nSimilarity: {}\nContent:\n{}\n",
            i + 1,
            insight.path,
            insight.similarity,
            insight.content,
        ));
    }

    format!(
        "## Current Question\n\n\
         The user has written this Question note:\n\n\
         ```\n{current_question}\n```\n\n\
         ## Retrieved Past Insights\n\n\
         These are the user's past Insights, ranked by relevance to the current Question:\n\n\
         {insights_text}\n\n\
         ## Your Task\n\n\
         Based on the current Question and the retrieved Insights:\n\
         1. Identify connections between the Question and past Insights\n\
         2. Detect any tensions or potential contradictions\n\
         3. Generate questions that help the user explore these relationships\n\n\
         Remember: Generate questions, NOT answers. Quote the Insights when referencing them.\n\n\
         Return your response as a JSON object with a \"questions\" array.\n"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    MemoryInvoke,
    ConflictDetect,
    Amplify,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonQuestion {
    #[serde(rename = "type")]
    pub kind: QuestionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insight_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    pub question: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedQuestions {
    pub questions: Vec<ComparisonQuestion>,
    pub token_usage: TokenUsage,
}

fn fallback(question: &str) -> GeneratedQuestions {
    GeneratedQuestions {
        questions: vec![ComparisonQuestion {
            kind: QuestionType::Amplify,
            insight_reference: None,
            quote: None,
            question: question.to_string(),
        }],
        token_usage: TokenUsage::default(),
    }
}

/// Parse the model's JSON reply into questions. Unknown question types
/// degrade to `amplify`; missing fields degrade to empty/absent.
fn parse_model_reply(content: &str) -> Result<Vec<ComparisonQuestion>, serde_json::Error> {
    let parsed: serde_json::Value = serde_json::from_str(content)?;

    let questions = parsed
        .get("questions")
        .and_then(|q| q.as_array())
        .map(|items| {
            items
                .iter()
                .map(|q| {
                    let kind = q
                        .get("type")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or(QuestionType::Amplify);
                    let text_field = |key: &str| {
                        q.get(key)
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string())
                    };
                    ComparisonQuestion {
                        kind,
                        insight_reference: text_field("insight_reference"),
                        quote: text_field("quote"),
                        question: text_field("question").unwrap_or_default(),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(questions)
}

/// Chat-model client for comparison question generation.
pub struct QuestionGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl QuestionGenerator {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
        })
    }

    /// Generate questions for `current_question` against its retrieved
    /// Insights.
    ///
    /// With no Insights there is nothing to compare: returns a single
    /// `amplify` question without calling the model. Transport and API
    /// errors propagate; a malformed model reply falls back.
    pub async fn generate(
        &self,
        current_question: &str,
        insights: &[RetrievedInsight],
    ) -> Result<GeneratedQuestions> {
        if insights.is_empty() {
            return Ok(fallback(
                "No related Insights found. What new understanding are you seeking with this question?",
            ));
        }

        let user_prompt = build_user_prompt(current_question, insights);

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": 0.7,
            "max_tokens": 1500,
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let content = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default();

        let questions = match parse_model_reply(content) {
            Ok(questions) => questions,
            Err(e) => {
                error!("failed to parse model reply: {}", e);
                return Ok(fallback("Failed to generate questions. Please try again."));
            }
        };

        let token_usage = TokenUsage {
            prompt: json
                .pointer("/usage/prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            completion: json
                .pointer("/usage/completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        };

        info!(
            questions = questions.len(),
            prompt_tokens = token_usage.prompt,
            completion_tokens = token_usage.completion,
            "generated comparison questions"
        );

        Ok(GeneratedQuestions {
            questions,
            token_usage,
        })
    }
}
