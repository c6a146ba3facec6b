//! Voice response documents returned to the telephony vendor.
//!
//! Only the handful of verbs the call flow needs are modelled. Documents are
//! rendered by hand; every attribute and text node is XML-escaped.

use axum::{
    http::header,
    response::{IntoResponse, Response},
};

/// One instruction in a voice response.
#[derive(Debug, Clone, PartialEq)]
pub enum Verb {
    Play {
        url: String,
    },
    Say {
        text: String,
        voice: String,
        language: String,
    },
    /// Speech gather; nested verbs play while the microphone is open.
    Gather {
        action: String,
        timeout_secs: u32,
        children: Vec<Verb>,
    },
    Redirect {
        url: String,
    },
    Pause {
        secs: u32,
    },
    Hangup,
    /// Fork call audio to a media WebSocket.
    StartStream {
        url: String,
        params: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceResponse {
    verbs: Vec<Verb>,
}

impl VoiceResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, verb: Verb) -> &mut Self {
        self.verbs.push(verb);
        self
    }

    pub fn verbs(&self) -> &[Verb] {
        &self.verbs
    }

    pub fn render(&self) -> String {
        let mut out = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#);
        for verb in &self.verbs {
            render_verb(&mut out, verb);
        }
        out.push_str("</Response>");
        out
    }
}

fn render_verb(out: &mut String, verb: &Verb) {
    match verb {
        Verb::Play { url } => {
            out.push_str("<Play>");
            out.push_str(&escape(url));
            out.push_str("</Play>");
        }
        Verb::Say {
            text,
            voice,
            language,
        } => {
            out.push_str(&format!(
                r#"<Say voice="{}" language="{}">{}</Say>"#,
                escape(voice),
                escape(language),
                escape(text)
            ));
        }
        Verb::Gather {
            action,
            timeout_secs,
            children,
        } => {
            out.push_str(&format!(
                r#"<Gather input="speech" action="{}" method="POST" timeout="{}" speechTimeout="auto" language="en-US">"#,
                escape(action),
                timeout_secs
            ));
            for child in children {
                render_verb(out, child);
            }
            out.push_str("</Gather>");
        }
        Verb::Redirect { url } => {
            out.push_str(r#"<Redirect method="POST">"#);
            out.push_str(&escape(url));
            out.push_str("</Redirect>");
        }
        Verb::Pause { secs } => {
            out.push_str(&format!(r#"<Pause length="{}"/>"#, secs));
        }
        Verb::Hangup => out.push_str("<Hangup/>"),
        Verb::StartStream { url, params } => {
            out.push_str(&format!(r#"<Start><Stream url="{}">"#, escape(url)));
            for (name, value) in params {
                out.push_str(&format!(
                    r#"<Parameter name="{}" value="{}"/>"#,
                    escape(name),
                    escape(value)
                ));
            }
            out.push_str("</Stream></Start>");
        }
    }
}

/// Escapes the five XML special characters.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

impl IntoResponse for VoiceResponse {
    fn into_response(self) -> Response {
        ([(header::CONTENT_TYPE, "text/xml")], self.render()).into_response()
    }
}
