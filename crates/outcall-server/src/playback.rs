//! Turns scripted lines into playable verbs.

use crate::twiml::Verb;
use outcall_dialog::{Line, LineScope};
use outcall_types::{AudioCategory, VoiceKind};
use outcall_voice::{AudioResolver, ResolveOptions, ResolvedAudio};

/// Cache metadata for a line spoken during a call of `module_id`.
pub fn resolve_options(line: &Line, module_id: &str) -> ResolveOptions {
    match line.scope {
        LineScope::Shared => ResolveOptions::shared(line.category),
        LineScope::Module => ResolveOptions::owned(line.category, module_id),
        LineScope::Call => ResolveOptions::transient(line.category),
    }
}

pub fn audio_verb(audio: ResolvedAudio) -> Verb {
    match audio {
        ResolvedAudio::Playable { url, .. } => Verb::Play { url },
        ResolvedAudio::VendorTts {
            text,
            voice,
            language,
        } => Verb::Say {
            text,
            voice: voice.to_string(),
            language: language.to_string(),
        },
    }
}

/// Resolves each line in order. Never fails: unresolvable lines come back as
/// vendor speech.
pub async fn line_verbs<'a, I>(
    resolver: &AudioResolver,
    voice: VoiceKind,
    module_id: &str,
    lines: I,
) -> Vec<Verb>
where
    I: IntoIterator<Item = &'a Line>,
{
    let mut verbs = Vec::new();
    for line in lines {
        let audio = resolver
            .resolve(&line.text, voice, &resolve_options(line, module_id))
            .await;
        tracing::debug!(
            category = line.category.as_str(),
            source = ?audio.source(),
            "line resolved"
        );
        verbs.push(audio_verb(audio));
    }
    verbs
}

/// A single shared system line, e.g. the apology.
pub async fn system_line(resolver: &AudioResolver, voice: VoiceKind, text: &str) -> Verb {
    audio_verb(
        resolver
            .resolve(text, voice, &ResolveOptions::shared(AudioCategory::System))
            .await,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(scope: LineScope) -> Line {
        Line {
            text: "Do you own your home?".into(),
            category: AudioCategory::Question,
            scope,
            question: Some(0),
        }
    }

    #[test]
    fn scope_maps_to_cache_ownership() {
        let shared = resolve_options(&line(LineScope::Shared), "refi");
        assert!(shared.shared);
        assert_eq!(shared.owner_module, None);

        let owned = resolve_options(&line(LineScope::Module), "refi");
        assert!(!owned.shared);
        assert_eq!(owned.owner_module.as_deref(), Some("refi"));

        let transient = resolve_options(&line(LineScope::Call), "refi");
        assert!(!transient.shared);
        assert_eq!(transient.owner_module, None);
    }

    #[test]
    fn vendor_fallback_becomes_say() {
        let verb = audio_verb(ResolvedAudio::VendorTts {
            text: "Hello".into(),
            voice: "Polly.Joanna",
            language: "en-US",
        });
        assert_eq!(
            verb,
            Verb::Say {
                text: "Hello".into(),
                voice: "Polly.Joanna".into(),
                language: "en-US".into(),
            }
        );
    }
}
