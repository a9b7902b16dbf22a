//! Roleplay scenario generation
//!
//! Builds a tutoring prompt for a German lesson topic, asks Gemini for a JSON
//! scenario through the key pool, and validates the answer.

use backend::{BackendError, GeminiClient, GenerateRequest};
use key_pool::Dispatcher;
use serde::{Deserialize, Serialize};

use crate::error::{Error, INVALID_OUTPUT_PREFIX, Result};

/// CEFR proficiency level (A0 = absolute beginner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum UserLevel {
    A0,
    A1,
    A2,
    B1,
    B2,
    C1,
    C2,
}

impl UserLevel {
    fn as_str(&self) -> &'static str {
        match self {
            UserLevel::A0 => "A0",
            UserLevel::A1 => "A1",
            UserLevel::A2 => "A2",
            UserLevel::B1 => "B1",
            UserLevel::B2 => "B2",
            UserLevel::C1 => "C1",
            UserLevel::C2 => "C2",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleplayInput {
    pub topic_title: String,
    pub user_level: UserLevel,
    #[serde(default)]
    pub vocabulary: Vec<String>,
}

/// A generated scenario. Accepts the camelCase keys the model is asked for.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RoleplayScenario {
    pub scenario: String,
    #[serde(alias = "aiRole")]
    pub ai_role: String,
    #[serde(alias = "userRole")]
    pub user_role: String,
    #[serde(alias = "initialMessage")]
    pub initial_message: String,
    pub objectives: Vec<String>,
}

/// Render the generation prompt for `input`.
pub fn render_prompt(input: &RoleplayInput) -> String {
    let vocabulary = if input.vocabulary.is_empty() {
        "none".to_string()
    } else {
        input.vocabulary.join(", ")
    };

    format!(
        r#"You are a German tutor running a short roleplay with a student.

Topic: "{topic}"
Student level: {level}
Lesson vocabulary to weave in where natural: {vocabulary}

Pick one time frame for the conversation (past, present or future) and keep to it.
Use grammar suited to the level: simple Perfekt for A-levels, Präteritum or Plusquamperfekt from B2.

Reply with a JSON object with exactly these keys:
- "scenario": the situation, in Russian, consistent with the chosen time frame
- "aiRole": your character, in Russian
- "userRole": the student's character, in Russian (simple everyday roles for A1-A2, more specific ones from B1)
- "initialMessage": your first line, in German, that sets the time frame
- "objectives": 2 or 3 goals for the student, in Russian; one of them names the time frame"#,
        topic = input.topic_title,
        level = input.user_level.as_str(),
    )
}

/// Parse and validate the model's JSON answer.
///
/// Tolerates a Markdown code fence around the document.
pub fn parse_scenario(text: &str) -> Result<RoleplayScenario> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);

    let scenario: RoleplayScenario =
        serde_json::from_str(body.trim()).map_err(|e| Error::InvalidModelOutput(e.to_string()))?;

    let required = [
        ("scenario", &scenario.scenario),
        ("aiRole", &scenario.ai_role),
        ("userRole", &scenario.user_role),
        ("initialMessage", &scenario.initial_message),
    ];
    if let Some((name, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
        return Err(Error::InvalidModelOutput(format!("{name} is empty")));
    }
    if scenario.objectives.is_empty() {
        return Err(Error::InvalidModelOutput("objectives is empty".into()));
    }

    Ok(scenario)
}

/// Generate a scenario for `input` through the key pool.
///
/// Output is validated inside each attempt, so an unusable answer moves on
/// to the next key like any other failure. If every attempt ends that way
/// the result is `Error::InvalidModelOutput`.
pub async fn start_roleplay(
    dispatcher: &Dispatcher<GeminiClient>,
    input: &RoleplayInput,
) -> Result<RoleplayScenario> {
    let request = GenerateRequest::new(render_prompt(input)).json();
    let request = &request;

    let result = dispatcher
        .execute(|client| async move {
            let response = client.generate(request).await?;
            parse_scenario(&response.text).map_err(|e| BackendError::new(e.to_string()))
        })
        .await;

    match result {
        Ok(scenario) => Ok(scenario),
        Err(key_pool::Error::Backend(e)) => match e.message().strip_prefix(INVALID_OUTPUT_PREFIX) {
            Some(detail) => Err(Error::InvalidModelOutput(detail.to_string())),
            None => Err(key_pool::Error::Backend(e).into()),
        },
        Err(e) => Err(e.into()),
    }
}
