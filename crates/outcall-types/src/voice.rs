//! Voice selection.
//!
//! Callers pick a voice by key when a call is created. The set of voices is
//! closed: every key maps to one `VoiceKind`, and lookups of unknown keys go
//! through [`VoiceKind::from_key_or_default`] so the caller decides how to
//! report the fallback.

use serde::{Deserialize, Serialize};

/// Voices the service can speak with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceKind {
    /// Warm, measured female voice.
    #[default]
    FemaleProfessional,
    /// Deep, measured male voice.
    MaleProfessional,
    /// Upbeat female voice.
    FemaleFriendly,
    /// Upbeat male voice.
    MaleFriendly,
}

impl VoiceKind {
    /// Every supported voice, in presentation order.
    pub const ALL: [VoiceKind; 4] = [
        Self::FemaleProfessional,
        Self::MaleProfessional,
        Self::FemaleFriendly,
        Self::MaleFriendly,
    ];

    /// Stable key used in URLs, cache keys and the database.
    pub fn key(self) -> &'static str {
        match self {
            Self::FemaleProfessional => "female_professional",
            Self::MaleProfessional => "male_professional",
            Self::FemaleFriendly => "female_friendly",
            Self::MaleFriendly => "male_friendly",
        }
    }

    /// Looks up a voice by key. The short keys `female` and `male` select the
    /// professional variants.
    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "female" | "female_professional" => Some(Self::FemaleProfessional),
            "male" | "male_professional" => Some(Self::MaleProfessional),
            "female_friendly" => Some(Self::FemaleFriendly),
            "male_friendly" => Some(Self::MaleFriendly),
            _ => None,
        }
    }

    /// Looks up a voice by key, returning the default voice and `false` when
    /// the key is unknown.
    pub fn from_key_or_default(key: &str) -> (Self, bool) {
        match Self::from_key(key) {
            Some(voice) => (voice, true),
            None => (Self::default(), false),
        }
    }

    /// Voice identifier at the speech-synthesis provider.
    pub fn synthesis_voice_id(self) -> &'static str {
        match self {
            Self::FemaleProfessional => "21m00Tcm4TlvDq8ikWAM",
            Self::MaleProfessional => "pNInz6obpgDQGcFmaJgB",
            Self::FemaleFriendly => "EXAVITQu4vr4xnSDxMaL",
            Self::MaleFriendly => "ErXwobaYiN019PkySvjV",
        }
    }

    /// Voice name understood by the telephony vendor's built-in TTS, used
    /// when synthesis is unavailable.
    pub fn vendor_voice(self) -> &'static str {
        match self {
            Self::FemaleProfessional => "Polly.Joanna",
            Self::MaleProfessional => "Polly.Matthew",
            Self::FemaleFriendly => "Polly.Salli",
            Self::MaleFriendly => "Polly.Joey",
        }
    }

    /// BCP-47 language tag spoken by this voice.
    pub fn language(self) -> &'static str {
        "en-US"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        for voice in VoiceKind::ALL {
            assert_eq!(VoiceKind::from_key(voice.key()), Some(voice));
        }
    }

    #[test]
    fn short_and_hyphenated_keys_resolve() {
        assert_eq!(VoiceKind::from_key("male"), Some(VoiceKind::MaleProfessional));
        assert_eq!(
            VoiceKind::from_key("Female-Friendly"),
            Some(VoiceKind::FemaleFriendly)
        );
    }

    #[test]
    fn unknown_key_falls_back_to_default() {
        let (voice, known) = VoiceKind::from_key_or_default("robot");
        assert_eq!(voice, VoiceKind::FemaleProfessional);
        assert!(!known);
    }

    #[test]
    fn serde_uses_snake_case_keys() {
        let json = serde_json::to_string(&VoiceKind::MaleFriendly).expect("serialize");
        assert_eq!(json, "\"male_friendly\"");
    }
}
