pub mod ansi;
pub mod json;
mod source_map;

pub use source_map::SourceMap;

use crate::lexer::{LexError, LexErrorKind, Span};
use crate::parser::CompileError;
use crate::vm::RuntimeError;

/// Which stage rejected the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Io,
    Syntax,
    Compile,
    Runtime,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Io => "io",
            Phase::Syntax => "syntax",
            Phase::Compile => "compile",
            Phase::Runtime => "runtime",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

/// A renderable error report, independent of the output format.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub phase: Phase,
    pub message: String,
    pub label: Option<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(phase: Phase, message: impl Into<String>) -> Self {
        Diagnostic {
            phase,
            message: message.into(),
            label: None,
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.label = Some(Label { span, message: label.into() });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// ---- From impls for the error types ----

impl From<&LexError> for Diagnostic {
    fn from(e: &LexError) -> Self {
        let d = Diagnostic::error(Phase::Syntax, format!("{} near '{}'", e.kind, e.snippet))
            .with_span(e.span, "here");
        match e.kind {
            LexErrorKind::UnterminatedString => d.with_suggestion("close the string with a matching quote"),
            LexErrorKind::InvalidEscape => d.with_note(r#"valid escapes: \n \t \r \a \b \f \v \\ \" \' \z \xHH \ddd \u{XXX}"#),
            _ => d,
        }
    }
}

impl From<&CompileError> for Diagnostic {
    fn from(e: &CompileError) -> Self {
        let label = match e {
            CompileError::Lex(lex) => return Diagnostic::from(lex),
            CompileError::UnclosedBlock { .. } => "block opened here",
            CompileError::ContinueIntoScope { .. } => "this continue",
            _ => "here",
        };
        let phase = match e {
            CompileError::UnexpectedToken { .. } | CompileError::UnclosedBlock { .. } => Phase::Syntax,
            _ => Phase::Compile,
        };
        let d = Diagnostic::error(phase, e.to_string()).with_span(e.span(), label);
        match e {
            CompileError::ContinueIntoScope { name, .. } => d
                .with_note(format!("'{name}' is declared after the continue but still in scope where the loop repeats"))
                .with_suggestion(format!("declare '{name}' before the continue or move it into an inner block")),
            CompileError::TooManySlots { .. } => {
                d.with_note("a chunk can address at most 256 locals and temporaries at once")
            }
            _ => d,
        }
    }
}

impl From<&RuntimeError> for Diagnostic {
    fn from(e: &RuntimeError) -> Self {
        Diagnostic::error(Phase::Runtime, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_builder() {
        let d = Diagnostic::error(Phase::Compile, "something went wrong")
            .with_span(Span { start: 5, end: 8 }, "here")
            .with_note("a note")
            .with_suggestion("a fix");
        assert_eq!(d.message, "something went wrong");
        assert_eq!(d.label.as_ref().map(|l| l.span), Some(Span { start: 5, end: 8 }));
        assert_eq!(d.notes, vec!["a note"]);
        assert_eq!(d.suggestion.as_deref(), Some("a fix"));
        assert!(d.source.is_none());
    }

    #[test]
    fn from_lex_error() {
        let e = crate::parser::compile("x = 'open").unwrap_err();
        let d = Diagnostic::from(&e);
        assert_eq!(d.phase, Phase::Syntax);
        assert!(d.message.contains("unfinished string"), "{}", d.message);
        assert_eq!(d.label.map(|l| l.span.start), Some(4));
        assert!(d.suggestion.is_some());
    }

    #[test]
    fn from_unexpected_token() {
        let e = crate::parser::compile("local = 1").unwrap_err();
        let d = Diagnostic::from(&e);
        assert_eq!(d.phase, Phase::Syntax);
        assert_eq!(d.message, "<name> expected near '='");
        assert_eq!(d.label.map(|l| l.span), Some(Span { start: 6, end: 7 }));
    }

    #[test]
    fn from_continue_into_scope() {
        let e = crate::parser::compile("repeat continue local x until x").unwrap_err();
        let d = Diagnostic::from(&e);
        assert_eq!(d.phase, Phase::Compile);
        assert!(d.notes[0].contains("'x'"));
        assert_eq!(d.label.map(|l| l.span), Some(Span { start: 7, end: 15 }));
    }

    #[test]
    fn from_runtime_error() {
        let e = RuntimeError::NotCallable { ty: "nil" };
        let d = Diagnostic::from(&e);
        assert_eq!(d.phase, Phase::Runtime);
        assert_eq!(d.message, "attempt to call a nil value");
        assert!(d.label.is_none());
    }
}
