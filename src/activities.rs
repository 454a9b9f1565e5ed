//! Built-in activities used by the greeting workflow.
//!
//! Both activities are pure functions of their input and therefore tolerate
//! the at-least-once delivery of the [gateway](crate::gateway): re-running an
//! attempt produces the same output.

use serde::{Deserialize, Serialize};

use crate::activity::{self, Activity};

/// Input to the [`Greet`] activity.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GreetInput {
    /// Who is being greeted.
    pub user_identifier: String,

    /// Optional salutation; defaults to `"Hello"`.
    pub custom_message: Option<String>,
}

/// Builds the workflow's greeting string.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greet;

impl Activity for Greet {
    const NAME: &'static str = "greet";

    type Input = GreetInput;
    type Output = String;

    async fn execute(&self, input: Self::Input) -> activity::Result<Self::Output> {
        if input.user_identifier.trim().is_empty() {
            return Err(activity::Error::fatal(
                "empty_user",
                "user identifier must not be empty",
            ));
        }

        let salutation = input.custom_message.as_deref().unwrap_or("Hello");

        Ok(format!(
            "{salutation}, {user}! Welcome to the Slackagent workflow!",
            user = input.user_identifier
        ))
    }
}

/// Input to the [`ProcessText`] activity.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProcessInput {
    /// Text to process.
    pub text_payload: String,

    /// Whether to upper-case the processed message.
    pub uppercase: bool,
}

/// Prefixes the text payload with `"Processed: "`, optionally upper-casing.
///
/// When `uppercase_prefix` is set (the default), the case transform covers
/// the whole message including the prefix; otherwise only the payload is
/// transformed.
#[derive(Debug, Clone, Copy)]
pub struct ProcessText {
    /// Whether the uppercase transform also applies to the prefix.
    pub uppercase_prefix: bool,
}

impl Default for ProcessText {
    fn default() -> Self {
        Self {
            uppercase_prefix: true,
        }
    }
}

impl Activity for ProcessText {
    const NAME: &'static str = "process-text";

    type Input = ProcessInput;
    type Output = String;

    async fn execute(&self, input: Self::Input) -> activity::Result<Self::Output> {
        if input.text_payload.trim().is_empty() {
            return Err(activity::Error::fatal(
                "empty_payload",
                "text payload must not be empty",
            ));
        }

        let message = if input.uppercase && !self.uppercase_prefix {
            format!("Processed: {}", input.text_payload.to_uppercase())
        } else {
            format!("Processed: {}", input.text_payload)
        };

        if input.uppercase && self.uppercase_prefix {
            Ok(message.to_uppercase())
        } else {
            Ok(message)
        }
    }
}
