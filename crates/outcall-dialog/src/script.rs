//! Fixed lines spoken around the module's questions.

use serde::{Deserialize, Serialize};

/// Wording of everything the agent says that is not a module question.
///
/// `greeting` may contain `{name}`, `{module}` and `{company}` placeholders.
/// Reprompt lists are indexed by attempt; the second entry is the more
/// directive one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
    pub company: String,
    pub greeting: String,
    pub availability_prompt: String,
    pub confirmation: String,
    pub decline: String,
    pub no_response: String,
    pub availability_reprompts: Vec<String>,
    pub question_reprompts: Vec<String>,
    pub outro_positive: String,
    pub outro_negative: String,
    pub outro_neutral: String,
    pub farewell: String,
    pub apology: String,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            company: "our team".to_string(),
            greeting: "Hello {name}, this is an automated call from {company} about {module}."
                .to_string(),
            availability_prompt: "Do you have a couple of minutes to answer a few quick questions?"
                .to_string(),
            confirmation: "Great, thank you.".to_string(),
            decline: "No problem. Thank you for your time, and have a good day.".to_string(),
            no_response: "Sorry, we couldn't hear you. We'll try again another time. Goodbye."
                .to_string(),
            availability_reprompts: vec![
                "Sorry, I didn't catch that. Do you have a couple of minutes?".to_string(),
                "Please just say yes or no. Do you have a couple of minutes right now?"
                    .to_string(),
            ],
            question_reprompts: vec![
                "Sorry, I didn't catch that. Could you repeat your answer?".to_string(),
                "Please answer clearly, for example with yes or no.".to_string(),
            ],
            outro_positive: "Thanks, it sounds like this could be a good fit. \
                             Someone from our team will follow up with you."
                .to_string(),
            outro_negative: "Thanks for your honest answers. \
                             We'll keep your preferences on file."
                .to_string(),
            outro_neutral: "Thanks for your answers. \
                            We'll review them and get back to you if there's a match."
                .to_string(),
            farewell: "Have a great day. Goodbye.".to_string(),
            apology: "We're sorry, something went wrong on our end. \
                      We'll call you back later. Goodbye."
                .to_string(),
        }
    }
}

impl Script {
    /// The opening line for one customer.
    pub fn greeting_for(&self, name: Option<&str>, module: &str) -> String {
        let name = name.map(str::trim).filter(|n| !n.is_empty()).unwrap_or("there");
        self.greeting
            .replace("{name}", name)
            .replace("{module}", module)
            .replace("{company}", &self.company)
    }

    /// Whether the greeting changes per customer and so cannot be shared.
    pub fn greeting_is_personal(&self) -> bool {
        self.greeting.contains("{name}")
    }

    /// Reprompt for zero-based `attempt`, clamped to the last configured line.
    pub fn reprompt(&self, availability: bool, attempt: u32) -> Option<&str> {
        let lines = if availability {
            &self.availability_reprompts
        } else {
            &self.question_reprompts
        };
        let last = lines.len().checked_sub(1)?;
        lines.get((attempt as usize).min(last)).map(String::as_str)
    }

    /// Every line that is the same for all customers of a module.
    pub fn shared_lines(&self) -> Vec<&str> {
        let mut lines = vec![
            self.availability_prompt.as_str(),
            self.confirmation.as_str(),
            self.decline.as_str(),
            self.no_response.as_str(),
            self.outro_positive.as_str(),
            self.outro_negative.as_str(),
            self.outro_neutral.as_str(),
            self.farewell.as_str(),
            self.apology.as_str(),
        ];
        lines.extend(self.availability_reprompts.iter().map(String::as_str));
        lines.extend(self.question_reprompts.iter().map(String::as_str));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_fills_placeholders() {
        let script = Script {
            company: "Acme Lending".into(),
            ..Script::default()
        };
        assert_eq!(
            script.greeting_for(Some("Dana"), "Refinance"),
            "Hello Dana, this is an automated call from Acme Lending about Refinance."
        );
        assert!(script.greeting_for(Some("  "), "x").starts_with("Hello there,"));
        assert!(script.greeting_is_personal());
    }

    #[test]
    fn reprompt_clamps_to_last_line() {
        let script = Script::default();
        assert_eq!(
            script.reprompt(false, 0),
            Some(script.question_reprompts[0].as_str())
        );
        assert_eq!(
            script.reprompt(false, 5),
            Some(script.question_reprompts[1].as_str())
        );
        let empty = Script {
            availability_reprompts: Vec::new(),
            ..Script::default()
        };
        assert_eq!(empty.reprompt(true, 0), None);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let script: Script = serde_json::from_str(r#"{"company": "Acme"}"#).expect("parse");
        assert_eq!(script.company, "Acme");
        assert_eq!(script.farewell, Script::default().farewell);
    }
}
