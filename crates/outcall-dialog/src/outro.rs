//! Closing-line policy and call evaluation.
//!
//! The tone of the outro is decided by a strict majority over the answers
//! that were classified: more than half YES is positive, more than half NO
//! is negative, anything else (including no classified answers) is neutral.
//! Questions that ended in "no clear response" do not vote.

use outcall_types::{CallStatus, Evaluation, Intent};
use std::collections::BTreeMap;

use crate::script::Script;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutroTone {
    Positive,
    Negative,
    Neutral,
}

impl OutroTone {
    pub fn from_intents<I>(intents: I) -> Self
    where
        I: IntoIterator<Item = Intent>,
    {
        let (mut yes, mut no, mut total) = (0usize, 0usize, 0usize);
        for intent in intents {
            total += 1;
            match intent {
                Intent::Yes => yes += 1,
                Intent::No => no += 1,
                Intent::Maybe => {}
            }
        }
        if yes * 2 > total {
            Self::Positive
        } else if no * 2 > total {
            Self::Negative
        } else {
            Self::Neutral
        }
    }

    /// Evaluation result recorded for a call that ended with this tone.
    pub fn result(self) -> &'static str {
        match self {
            Self::Positive => "interested",
            Self::Negative => "not_interested",
            Self::Neutral => "undecided",
        }
    }

    pub fn line(self, script: &Script) -> &str {
        match self {
            Self::Positive => &script.outro_positive,
            Self::Negative => &script.outro_negative,
            Self::Neutral => &script.outro_neutral,
        }
    }
}

fn tally(intents: &BTreeMap<usize, Intent>) -> (usize, usize, usize) {
    intents
        .values()
        .fold((0, 0, 0), |(yes, no, maybe), intent| match intent {
            Intent::Yes => (yes + 1, no, maybe),
            Intent::No => (yes, no + 1, maybe),
            Intent::Maybe => (yes, no, maybe + 1),
        })
}

/// Evaluation for a call whose questions were worked through.
/// `intents` maps question index to its classified answer.
pub fn evaluate_answers(intents: &BTreeMap<usize, Intent>, question_count: usize) -> Evaluation {
    let (yes, no, maybe) = tally(intents);
    let comments =
        format!("{yes} yes, {no} no, {maybe} maybe across {question_count} questions");
    if intents.is_empty() && question_count > 0 {
        return Evaluation {
            result: "incomplete".to_string(),
            comments,
        };
    }
    Evaluation {
        result: OutroTone::from_intents(intents.values().copied())
            .result()
            .to_string(),
        comments,
    }
}

pub fn declined(comments: &str) -> Evaluation {
    Evaluation {
        result: "declined".to_string(),
        comments: comments.to_string(),
    }
}

pub fn no_response() -> Evaluation {
    Evaluation {
        result: "no_answer".to_string(),
        comments: "no clear response to the availability check".to_string(),
    }
}

/// Evaluation for a call that reached a terminal status without the
/// conversation finishing it, e.g. the customer hung up mid-survey.
pub fn evaluation_for_status(
    status: CallStatus,
    intents: &BTreeMap<usize, Intent>,
) -> Evaluation {
    let fixed = |result: &str, comments: &str| Evaluation {
        result: result.to_string(),
        comments: comments.to_string(),
    };
    match status {
        CallStatus::NoAnswer => fixed("no_answer", "the customer did not pick up"),
        CallStatus::Busy => fixed("busy", "the line was busy"),
        CallStatus::Failed => fixed("failed", "the call could not be placed"),
        CallStatus::Canceled => fixed("canceled", "the call was canceled"),
        _ if intents.is_empty() => fixed("incomplete", "the call ended before any answer"),
        _ => {
            let (yes, no, maybe) = tally(intents);
            Evaluation {
                result: OutroTone::from_intents(intents.values().copied())
                    .result()
                    .to_string(),
                comments: format!(
                    "call ended early; {yes} yes, {no} no, {maybe} maybe so far"
                ),
            }
        }
    }
}
