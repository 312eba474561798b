use super::{Diagnostic, SourceMap};

/// One-line JSON form of a diagnostic, for tools driving the CLI.
pub fn render(d: &Diagnostic) -> String {
    let source_map = d.source.as_deref().map(SourceMap::new);

    let mut obj = serde_json::json!({
        "severity": "error",
        "phase": d.phase.as_str(),
        "message": d.message,
        "notes": d.notes,
    });

    if let Some(label) = &d.label {
        let mut span = serde_json::json!({
            "start": label.span.start,
            "end": label.span.end,
            "message": label.message,
        });
        if let Some(map) = &source_map {
            let (line, col) = map.lookup(label.span.start);
            span["line"] = serde_json::Value::from(line);
            span["col"] = serde_json::Value::from(col);
        }
        obj["span"] = span;
    }

    if let Some(s) = &d.suggestion {
        obj["suggestion"] = serde_json::Value::String(s.clone());
    }

    obj.to_string()
}
