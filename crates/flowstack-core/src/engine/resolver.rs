//! Template tokenizer and typed variable resolution.
//!
//! Inputs reference run state through `{{path}}` tokens. A string that is
//! exactly one token resolves to the typed value at that path (a number stays
//! a number, an object stays an object); tokens embedded in a larger string
//! are stringified in place. Arrays and objects resolve recursively.
//!
//! Implemented as a character scanner over a tagged JSON value -- not text
//! substitution -- so resolved values are never re-interpolated and need no
//! escaping. Missing paths resolve to `null`, never an error, which keeps
//! `resolve` a pure function that is safe to call concurrently.

use std::collections::HashMap;

use serde_json::Value;

// ---------------------------------------------------------------------------
// Path grammar
// ---------------------------------------------------------------------------

/// One segment of a variable path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parse `a.b[0].c` into segments. Splits on `.` and `[n]`; malformed index
/// brackets fall back to being part of the key text.
fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut rest = part;
        // Leading key text before any bracket
        if let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                segments.push(Segment::Key(rest[..bracket].to_string()));
            }
            rest = &rest[bracket..];
            // Consume consecutive [n] suffixes
            while let Some(stripped) = rest.strip_prefix('[') {
                match stripped.find(']') {
                    Some(close) => match stripped[..close].trim().parse::<usize>() {
                        Ok(idx) => {
                            segments.push(Segment::Index(idx));
                            rest = &stripped[close + 1..];
                        }
                        Err(_) => {
                            // Not a numeric index: keep the raw text as a key
                            segments.push(Segment::Key(rest.to_string()));
                            rest = "";
                        }
                    },
                    None => {
                        segments.push(Segment::Key(rest.to_string()));
                        rest = "";
                    }
                }
            }
            if !rest.is_empty() {
                segments.push(Segment::Key(rest.to_string()));
            }
        } else {
            segments.push(Segment::Key(rest.to_string()));
        }
    }
    segments
}

/// The root identifier of a path: everything before the first `.` or `[`.
pub fn root_ident(path: &str) -> &str {
    let path = path.trim();
    let end = path
        .find(['.', '['])
        .unwrap_or(path.len());
    path[..end].trim()
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Look up a dotted/indexed path in the variables map.
///
/// Returns `None` when any segment is missing or of the wrong shape.
pub fn lookup<'a>(path: &str, variables: &'a HashMap<String, Value>) -> Option<&'a Value> {
    let segments = parse_path(path);
    let mut iter = segments.iter();

    let root = match iter.next()? {
        Segment::Key(k) => variables.get(k)?,
        Segment::Index(_) => return None,
    };

    let mut current = root;
    for segment in iter {
        current = match segment {
            Segment::Key(k) => current.get(k.as_str())?,
            Segment::Index(i) => current.get(i)?,
        };
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

/// A piece of a template string: literal text or a `{{path}}` token.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece<'a> {
    Literal(&'a str),
    Token(&'a str),
}

/// Split a string into literal and token pieces. An unterminated `{{` is
/// treated as literal text.
fn tokenize(input: &str) -> Vec<Piece<'_>> {
    let mut pieces = Vec::new();
    let mut rest = input;

    while let Some(open) = rest.find("{{") {
        match rest[open + 2..].find("}}") {
            Some(close) => {
                if open > 0 {
                    pieces.push(Piece::Literal(&rest[..open]));
                }
                let token = rest[open + 2..open + 2 + close].trim();
                pieces.push(Piece::Token(token));
                rest = &rest[open + 2 + close + 2..];
            }
            None => break,
        }
    }
    if !rest.is_empty() {
        pieces.push(Piece::Literal(rest));
    }
    pieces
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve every template token in `value` against `variables`.
///
/// - A string that is exactly one token returns the typed value at that
///   path (missing path -> `null`).
/// - A string with embedded tokens has each token stringified in place.
/// - Arrays and objects are resolved element-wise.
/// - Everything else passes through untouched.
pub fn resolve(value: &Value, variables: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => resolve_str(s, variables),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve(v, variables)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_str(input: &str, variables: &HashMap<String, Value>) -> Value {
    let pieces = tokenize(input);

    // Whole-string token: return the typed value untouched.
    if let [Piece::Token(path)] = pieces.as_slice() {
        return lookup(path, variables).cloned().unwrap_or(Value::Null);
    }

    // No tokens at all: the string passes through.
    if pieces.iter().all(|p| matches!(p, Piece::Literal(_))) {
        return Value::String(input.to_string());
    }

    let mut out = String::new();
    for piece in pieces {
        match piece {
            Piece::Literal(text) => out.push_str(text),
            Piece::Token(path) => {
                if let Some(v) = lookup(path, variables) {
                    out.push_str(&stringify(v));
                }
            }
        }
    }
    Value::String(out)
}

/// Convert a resolved value to its in-string form. Objects and arrays render
/// as compact JSON; missing/null values render as the empty string.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Token collection (for the graph builder)
// ---------------------------------------------------------------------------

/// Collect the path text of every `{{path}}` token in `value`, recursively.
pub fn collect_tokens(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for piece in tokenize(s) {
                if let Piece::Token(path) = piece {
                    out.push(path.to_string());
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_tokens(item, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_tokens(v, out);
            }
        }
        _ => {}
    }
}

/// Collect tokens from a bare expression string (condition/while clauses).
pub fn collect_tokens_str(input: &str, out: &mut Vec<String>) {
    for piece in tokenize(input) {
        if let Piece::Token(path) = piece {
            out.push(path.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> HashMap<String, Value> {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => panic!("vars helper expects an object"),
        }
    }

    // -----------------------------------------------------------------------
    // Whole-token typed resolution
    // -----------------------------------------------------------------------

    #[test]
    fn test_whole_token_returns_typed_number() {
        let v = vars(json!({ "a": { "b": [42] } }));
        let result = resolve(&json!("{{a.b[0]}}"), &v);
        assert_eq!(result, json!(42), "number stays a number");
    }

    #[test]
    fn test_whole_token_returns_typed_object() {
        let v = vars(json!({ "order": { "id": 7, "total": 9.5 } }));
        let result = resolve(&json!("{{order}}"), &v);
        assert_eq!(result, json!({ "id": 7, "total": 9.5 }));
    }

    #[test]
    fn test_whole_token_with_inner_whitespace() {
        let v = vars(json!({ "a": true }));
        assert_eq!(resolve(&json!("{{ a }}"), &v), json!(true));
    }

    #[test]
    fn test_missing_path_yields_null() {
        let v = vars(json!({ "a": 1 }));
        assert_eq!(resolve(&json!("{{a.b.c}}"), &v), Value::Null);
        assert_eq!(resolve(&json!("{{nope}}"), &v), Value::Null);
        assert_eq!(resolve(&json!("{{a[3]}}"), &v), Value::Null);
    }

    // -----------------------------------------------------------------------
    // Embedded stringification
    // -----------------------------------------------------------------------

    #[test]
    fn test_embedded_token_stringifies() {
        let v = vars(json!({ "a": 1 }));
        assert_eq!(resolve(&json!("x={{a}}"), &v), json!("x=1"));
    }

    #[test]
    fn test_multiple_embedded_tokens() {
        let v = vars(json!({ "name": "Ada", "n": 3 }));
        assert_eq!(
            resolve(&json!("{{name}} has {{n}} orders"), &v),
            json!("Ada has 3 orders")
        );
    }

    #[test]
    fn test_embedded_object_renders_compact_json() {
        let v = vars(json!({ "o": { "k": 1 } }));
        assert_eq!(resolve(&json!("payload: {{o}}"), &v), json!(r#"payload: {"k":1}"#));
    }

    #[test]
    fn test_embedded_missing_renders_empty() {
        let v = vars(json!({}));
        assert_eq!(resolve(&json!("x={{missing}}"), &v), json!("x="));
    }

    #[test]
    fn test_unterminated_token_is_literal() {
        let v = vars(json!({ "a": 1 }));
        assert_eq!(resolve(&json!("x={{a"), &v), json!("x={{a"));
    }

    #[test]
    fn test_plain_string_passes_through() {
        let v = vars(json!({}));
        assert_eq!(resolve(&json!("hello"), &v), json!("hello"));
    }

    // -----------------------------------------------------------------------
    // Recursive resolution
    // -----------------------------------------------------------------------

    #[test]
    fn test_arrays_and_objects_resolve_elementwise() {
        let v = vars(json!({ "user": { "name": "Ada" }, "n": 2 }));
        let input = json!({
            "to": "{{user.name}}",
            "counts": ["{{n}}", "literal", 5],
            "nested": { "again": "{{user}}" }
        });
        let result = resolve(&input, &v);
        assert_eq!(result["to"], json!("Ada"));
        assert_eq!(result["counts"], json!([2, "literal", 5]));
        assert_eq!(result["nested"]["again"], json!({ "name": "Ada" }));
    }

    #[test]
    fn test_non_string_scalars_untouched() {
        let v = vars(json!({}));
        assert_eq!(resolve(&json!(7), &v), json!(7));
        assert_eq!(resolve(&json!(true), &v), json!(true));
        assert_eq!(resolve(&Value::Null, &v), Value::Null);
    }

    #[test]
    fn test_resolved_values_not_reinterpolated() {
        // A variable whose value contains token syntax must not be expanded
        // a second time.
        let v = vars(json!({ "a": "{{b}}", "b": "secret" }));
        assert_eq!(resolve(&json!("{{a}}"), &v), json!("{{b}}"));
        assert_eq!(resolve(&json!("x={{a}}"), &v), json!("x={{b}}"));
    }

    // -----------------------------------------------------------------------
    // Path parsing and roots
    // -----------------------------------------------------------------------

    #[test]
    fn test_root_ident() {
        assert_eq!(root_ident("a.b.c"), "a");
        assert_eq!(root_ident("orders[0].id"), "orders");
        assert_eq!(root_ident(" trigger.body "), "trigger");
        assert_eq!(root_ident("plain"), "plain");
    }

    #[test]
    fn test_lookup_mixed_segments() {
        let v = vars(json!({ "a": { "list": [{ "x": "deep" }] } }));
        assert_eq!(lookup("a.list[0].x", &v), Some(&json!("deep")));
        assert_eq!(lookup("a.list[1].x", &v), None);
    }

    // -----------------------------------------------------------------------
    // Token collection
    // -----------------------------------------------------------------------

    #[test]
    fn test_collect_tokens_recursive() {
        let input = json!({
            "url": "https://x/{{page.id}}",
            "body": { "items": ["{{orders}}", "{{user.email}}"] }
        });
        let mut tokens = Vec::new();
        collect_tokens(&input, &mut tokens);
        tokens.sort();
        assert_eq!(tokens, vec!["orders", "page.id", "user.email"]);
    }

    #[test]
    fn test_collect_tokens_str() {
        let mut tokens = Vec::new();
        collect_tokens_str("{{count}} > 3 && {{flag}}", &mut tokens);
        assert_eq!(tokens, vec!["count", "flag"]);
    }
}
