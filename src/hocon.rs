//! Parser for the HOCON subset used by step, dag and application files.
//!
//! Plain JSON documents are accepted as well. Parsing happens in two passes:
//! the text is first read into raw fields, which are then folded into a
//! [`ConfigTree`] (expanding dotted keys and merging repeated objects) before
//! whole-value `${...}` substitutions are resolved against the finished tree.

use std::env;

use winnow::ascii::{multispace0, space0};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{any, literal, take_until, take_while};
use winnow::{ModalResult, Parser};

use crate::error::AiscalatorError;
use crate::tree::{ConfigTree, Number, Value};

enum Raw {
    Scalar(Value),
    Null,
    Object(Vec<Field>),
    Array(Vec<Raw>),
    Substitution { path: String, optional: bool },
}

struct Field {
    path: Vec<String>,
    value: Raw,
}

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

/// Drop `#` and `//` comments outside of quoted strings, keeping newlines so
/// line numbers stay correct.
pub(crate) fn strip_comments(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    let triple_at = |i: usize| i + 2 < len && chars[i] == '"' && chars[i + 1] == '"' && chars[i + 2] == '"';

    while i < len {
        let c = chars[i];
        if triple_at(i) {
            out.push_str("\"\"\"");
            i += 3;
            while i < len && !triple_at(i) {
                out.push(chars[i]);
                i += 1;
            }
            if i < len {
                out.push_str("\"\"\"");
                i += 3;
            }
        } else if c == '"' {
            out.push('"');
            i += 1;
            while i < len {
                if chars[i] == '\\' && i + 1 < len {
                    out.push(chars[i]);
                    out.push(chars[i + 1]);
                    i += 2;
                } else if chars[i] == '"' || chars[i] == '\n' {
                    out.push(chars[i]);
                    i += 1;
                    break;
                } else {
                    out.push(chars[i]);
                    i += 1;
                }
            }
        } else if c == '#' || (c == '/' && i + 1 < len && chars[i + 1] == '/') {
            while i < len && chars[i] != '\n' {
                i += 1;
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

fn hspace<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    space0.parse_next(input)
}

/// Whitespace, newlines and commas between entries.
fn separators(input: &mut &str) -> ModalResult<()> {
    loop {
        let _ = ws.parse_next(input)?;
        if input.starts_with(',') {
            let _ = ','.parse_next(input)?;
        } else {
            return Ok(());
        }
    }
}

fn end_of_entry(input: &mut &str, closing: Option<char>) -> ModalResult<()> {
    let _ = hspace.parse_next(input)?;
    let at_boundary = input.is_empty()
        || input.starts_with(['\n', '\r', ','])
        || closing.is_some_and(|close| input.starts_with(close));
    if at_boundary {
        Ok(())
    } else {
        Err(make_cut_error("newline or ',' between entries"))
    }
}

fn quoted_string(input: &mut &str) -> ModalResult<String> {
    if input.starts_with("\"\"\"") {
        let _ = literal("\"\"\"").parse_next(input)?;
        let body: &str = take_until(0.., "\"\"\"")
            .parse_next(input)
            .map_err(|_: ErrMode<ContextError>| make_cut_error("closing triple quote"))?;
        let _ = literal("\"\"\"").parse_next(input)?;
        return Ok(body.to_string());
    }

    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = any
            .parse_next(input)
            .map_err(|_: ErrMode<ContextError>| make_cut_error("closing quote"))?;
        match c {
            '"' => break,
            '\n' => return Err(make_cut_error("closing quote before end of line")),
            '\\' => {
                let esc = any.parse_next(input)?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    'r' => s.push('\r'),
                    'b' => s.push('\u{8}'),
                    'f' => s.push('\u{c}'),
                    '"' => s.push('"'),
                    '\\' => s.push('\\'),
                    '/' => s.push('/'),
                    'u' => {
                        let hex: &str =
                            take_while(4, |c: char| c.is_ascii_hexdigit()).parse_next(input)?;
                        let code = u32::from_str_radix(hex, 16)
                            .map_err(|_| make_cut_error("four hex digits after \\u"))?;
                        let decoded = char::from_u32(code)
                            .ok_or_else(|| make_cut_error("a valid unicode scalar"))?;
                        s.push(decoded);
                    }
                    _ => return Err(make_cut_error("a valid escape sequence")),
                }
            }
            other => s.push(other),
        }
    }
    Ok(s)
}

fn is_key_char(c: char) -> bool {
    !c.is_whitespace()
        && !matches!(
            c,
            '.' | '=' | ':' | '{' | '}' | '[' | ']' | ',' | '"' | '+' | '$'
        )
}

fn key_segment(input: &mut &str) -> ModalResult<String> {
    if input.starts_with('"') {
        return quoted_string.parse_next(input);
    }
    let segment: &str = take_while(1.., is_key_char)
        .parse_next(input)
        .map_err(|_: ErrMode<ContextError>| make_cut_error("a key"))?;
    Ok(segment.to_string())
}

/// `a.b."c.d"` becomes `["a", "b", "c.d"]`.
fn key_path(input: &mut &str) -> ModalResult<Vec<String>> {
    let mut path = vec![key_segment.parse_next(input)?];
    while input.starts_with('.') {
        let _ = '.'.parse_next(input)?;
        path.push(key_segment.parse_next(input)?);
    }
    Ok(path)
}

fn looks_numeric(text: &str) -> bool {
    text.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+')
        && text
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
}

fn classify_unquoted(text: &str) -> Raw {
    match text {
        "true" => return Raw::Scalar(Value::Bool(true)),
        "false" => return Raw::Scalar(Value::Bool(false)),
        "null" => return Raw::Null,
        _ => {}
    }
    if looks_numeric(text) {
        if let Ok(value) = text.parse::<i64>() {
            return Raw::Scalar(Value::Number(Number::Int(value)));
        }
        if let Ok(value) = text.parse::<f64>() {
            if value.is_finite() {
                return Raw::Scalar(Value::Number(Number::Float(value)));
            }
        }
    }
    Raw::Scalar(Value::String(text.to_string()))
}

fn substitution(input: &mut &str) -> ModalResult<Raw> {
    let _ = literal("${").parse_next(input)?;
    let optional = input.starts_with('?');
    if optional {
        let _ = '?'.parse_next(input)?;
    }
    let path: &str = take_while(1.., |c: char| c != '}' && c != '\n')
        .parse_next(input)
        .map_err(|_: ErrMode<ContextError>| make_cut_error("a substitution path"))?;
    let _ = '}'
        .parse_next(input)
        .map_err(|_: ErrMode<ContextError>| make_cut_error("'}' to close substitution"))?;
    Ok(Raw::Substitution {
        path: path.trim().to_string(),
        optional,
    })
}

fn value_node(input: &mut &str) -> ModalResult<Raw> {
    if input.starts_with('{') {
        let _ = '{'.parse_next(input)?;
        return object_body(input, Some('}')).map(Raw::Object);
    }
    if input.starts_with('[') {
        return array(input).map(Raw::Array);
    }
    if input.starts_with('"') {
        return quoted_string
            .map(|text| Raw::Scalar(Value::String(text)))
            .parse_next(input);
    }
    if input.starts_with("${") {
        return substitution(input);
    }
    let text: &str = take_while(0.., |c: char| !matches!(c, '\n' | '\r' | ',' | '}' | ']'))
        .parse_next(input)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(make_cut_error("a value"));
    }
    Ok(classify_unquoted(text))
}

fn array(input: &mut &str) -> ModalResult<Vec<Raw>> {
    let _ = '['.parse_next(input)?;
    let mut items = Vec::new();
    loop {
        separators(input)?;
        if input.starts_with(']') {
            let _ = ']'.parse_next(input)?;
            return Ok(items);
        }
        if input.is_empty() {
            return Err(make_cut_error("']' to close array"));
        }
        items.push(value_node(input)?);
        end_of_entry(input, Some(']'))?;
    }
}

fn field(input: &mut &str) -> ModalResult<Field> {
    let path = key_path.parse_next(input)?;
    let _ = hspace.parse_next(input)?;
    if input.starts_with('{') {
        let value = value_node(input)?;
        return Ok(Field { path, value });
    }
    if input.starts_with('=') || input.starts_with(':') {
        let _ = any.parse_next(input)?;
        let _ = hspace.parse_next(input)?;
        let value = value_node(input)?;
        return Ok(Field { path, value });
    }
    Err(make_cut_error("'=', ':' or '{' after key"))
}

fn object_body(input: &mut &str, closing: Option<char>) -> ModalResult<Vec<Field>> {
    let mut fields = Vec::new();
    loop {
        separators(input)?;
        match closing {
            Some(close) if input.starts_with(close) => {
                let _ = any.parse_next(input)?;
                return Ok(fields);
            }
            Some(_) if input.is_empty() => return Err(make_cut_error("'}' to close object")),
            None if input.is_empty() => return Ok(fields),
            _ => {}
        }
        fields.push(field(input)?);
        end_of_entry(input, closing)?;
    }
}

fn document(input: &mut &str) -> ModalResult<Vec<Field>> {
    let _ = ws.parse_next(input)?;
    let fields = if input.starts_with('{') {
        let _ = '{'.parse_next(input)?;
        object_body(input, Some('}'))?
    } else if input.starts_with('[') {
        return Err(make_cut_error("an object at the document root"));
    } else {
        object_body(input, None)?
    };
    let _ = ws.parse_next(input)?;
    if !input.is_empty() {
        return Err(make_cut_error("end of document"));
    }
    Ok(fields)
}

struct Pending {
    path: String,
    target: String,
    optional: bool,
}

enum Built {
    Value(Value),
    Null,
    Deferred,
}

fn nest(rest: &[String], value: Value) -> Value {
    rest.iter().rev().fold(value, |inner, key| {
        let mut tree = ConfigTree::new();
        tree.insert(key.clone(), inner);
        Value::Tree(tree)
    })
}

fn build_value(raw: Raw, path: &[String], pending: &mut Vec<Pending>) -> Result<Built, String> {
    match raw {
        Raw::Scalar(value) => Ok(Built::Value(value)),
        Raw::Null => Ok(Built::Null),
        Raw::Object(fields) => Ok(Built::Value(Value::Tree(build_object(
            fields, path, pending,
        )?))),
        Raw::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                // Pending paths carry no element index, so no substitution
                // may appear anywhere below an array.
                let mut nested = Vec::new();
                let built = build_value(item, path, &mut nested)?;
                if !nested.is_empty() {
                    return Err(format!(
                        "substitutions inside arrays are not supported (at {})",
                        path.join(".")
                    ));
                }
                if let Built::Value(value) = built {
                    values.push(value);
                }
            }
            Ok(Built::Value(Value::List(values)))
        }
        Raw::Substitution { path: target, optional } => {
            pending.push(Pending {
                path: path.join("."),
                target,
                optional,
            });
            Ok(Built::Deferred)
        }
    }
}

fn build_object(
    fields: Vec<Field>,
    prefix: &[String],
    pending: &mut Vec<Pending>,
) -> Result<ConfigTree, String> {
    let mut tree = ConfigTree::new();
    for Field { path, value } in fields {
        let Some((first, rest)) = path.split_first() else {
            continue;
        };
        let mut full = prefix.to_vec();
        full.extend(path.iter().cloned());
        match build_value(value, &full, pending)? {
            Built::Value(value) => tree.merge_entry(first.clone(), nest(rest, value)),
            Built::Null => {
                tree.remove_path(&path.join("."));
            }
            Built::Deferred => {}
        }
    }
    Ok(tree)
}

fn resolve_substitutions(tree: &mut ConfigTree, pending: Vec<Pending>) -> Result<(), String> {
    for item in pending {
        let resolved = tree
            .get_path(&item.target)
            .cloned()
            .or_else(|| env::var(&item.target).ok().map(Value::String));
        match resolved {
            Some(value) => tree.set_path(&item.path, value),
            None if item.optional => {}
            None => {
                return Err(format!(
                    "could not resolve substitution ${{{}}} for {}",
                    item.target, item.path
                ))
            }
        }
    }
    Ok(())
}

fn line_col(stripped: &str, remaining_len: usize) -> (usize, usize) {
    let consumed = stripped.len().saturating_sub(remaining_len);
    let prefix = &stripped[..consumed];
    let line = prefix.matches('\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(pos) => consumed - pos,
        None => consumed + 1,
    };
    (line, col)
}

/// Parses a HOCON (or JSON) document. `source_desc` names the origin in
/// error messages.
pub fn parse_str(text: &str, source_desc: &str) -> Result<ConfigTree, AiscalatorError> {
    let parse_error = |message: String| AiscalatorError::ConfigParse {
        source_desc: source_desc.to_string(),
        message,
    };

    let stripped = strip_comments(text);
    let mut remaining = stripped.as_str();
    let fields = document(&mut remaining).map_err(|err| {
        let (line, col) = line_col(&stripped, remaining.len());
        let detail = match err {
            ErrMode::Backtrack(inner) | ErrMode::Cut(inner) => inner.to_string(),
            ErrMode::Incomplete(_) => String::new(),
        };
        let detail = if detail.trim().is_empty() {
            "unexpected input".to_string()
        } else {
            detail.replace('\n', " ")
        };
        parse_error(format!("line {line}, column {col}: {detail}"))
    })?;

    let mut pending = Vec::new();
    let mut tree = build_object(fields, &[], &mut pending).map_err(parse_error)?;
    resolve_substitutions(&mut tree, pending).map_err(parse_error)?;
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ConfigTree {
        parse_str(text, "test").expect("parse")
    }

    #[test]
    fn parses_nested_step_definition() {
        let tree = parse(
            r#"
# step file
steps {
  demo {
    task {
      type = "jupyter"
      code_path: notebook/demo.py   // unquoted
      parameters = [
        { p1: 1 }, { p2: "two" }
      ]
    }
  }
}
"#,
        );
        assert_eq!(tree.get_str("steps.demo.task.type"), Some("jupyter"));
        assert_eq!(tree.get_str("steps.demo.task.code_path"), Some("notebook/demo.py"));
        let params = tree.get_list("steps.demo.task.parameters").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].as_tree().unwrap().get("p1"), Some(&Value::from(1)));
    }

    #[test]
    fn dotted_keys_expand_and_merge() {
        let tree = parse("a.b.c = 1\na.b.d = true\na { e = x }\n");
        assert_eq!(tree.get_path("a.b.c"), Some(&Value::from(1)));
        assert_eq!(tree.get_bool("a.b.d"), Some(true));
        assert_eq!(tree.get_str("a.e"), Some("x"));
        let keys: Vec<&str> = tree.get_tree("a").unwrap().iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["b", "e"]);
    }

    #[test]
    fn accepts_json_documents() {
        let tree = parse(r#"{"steps": {"demo": {"task": {"code_path": "nb.py", "n": 2.5}}}}"#);
        assert_eq!(tree.get_str("steps.demo.task.code_path"), Some("nb.py"));
        assert_eq!(
            tree.get_path("steps.demo.task.n"),
            Some(&Value::Number(Number::Float(2.5)))
        );
    }

    #[test]
    fn quoted_keys_are_single_segments() {
        let tree = parse("\"a.b\" = 1\n");
        assert!(tree.get("a.b").is_some());
        assert!(tree.get("a").is_none());
    }

    #[test]
    fn null_removes_keys_and_later_values_win() {
        let tree = parse("a = 1\nb = 2\na = null\nb = 3\n");
        assert!(tree.get("a").is_none());
        assert_eq!(tree.get("b"), Some(&Value::from(3)));
    }

    #[test]
    fn substitutions_resolve_against_tree() {
        let tree = parse("home = /data\ncopy = ${home}\nmaybe = ${?AISCALATOR_SURELY_UNSET_VAR}\n");
        assert_eq!(tree.get_str("copy"), Some("/data"));
        assert!(tree.get("maybe").is_none());
        let err = parse_str("x = ${missing.path}\n", "test").unwrap_err();
        assert!(err.to_string().contains("missing.path"));
    }

    #[test]
    fn substitutions_below_arrays_are_rejected() {
        let err = parse_str("home = /data\nx = [{ a = ${home} }, { a = b }]\n", "test").unwrap_err();
        assert!(matches!(err, AiscalatorError::ConfigParse { .. }));
        assert!(err.to_string().contains("inside arrays"));
        assert!(parse_str("home = /data\nx = [${home}]\n", "test").is_err());
    }

    #[test]
    fn dangling_separator_is_an_error() {
        let err = parse_str("steps:\n  demo:\n    task: x\n", "test").unwrap_err();
        assert!(err.to_string().contains("line 1"));
        assert_eq!(parse("a =   1\n").get_path("a"), Some(&Value::from(1)));
    }

    #[test]
    fn out_of_range_floats_stay_strings() {
        let tree = parse("big = 1e999\n");
        assert_eq!(tree.get_str("big"), Some("1e999"));
        assert_eq!(parse(&tree.to_hocon()), tree);
    }

    #[test]
    fn triple_quoted_strings_keep_content() {
        let tree = parse("text = \"\"\"line # one\nline two\"\"\"\n");
        assert_eq!(tree.get_str("text"), Some("line # one\nline two"));
    }

    #[test]
    fn garbage_reports_line_and_column() {
        let err = parse_str("a = 1\nthis is not config\n", "inline").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("inline"));
        assert!(text.contains("line 2"));
        assert!(matches!(err, AiscalatorError::ConfigParse { .. }));
    }

    #[test]
    fn unterminated_object_is_an_error() {
        assert!(parse_str("a { b = 1\n", "test").is_err());
        assert!(parse_str("[1, 2]", "test").is_err());
    }

    #[test]
    fn rendered_hocon_parses_back() {
        let original = parse(
            "aiscalator {\n  metadata.user.id = u42\n  airflow.setup.workspace_paths = [\"/a\", \"/b\"]\n  flag = false\n  ratio = 0.5\n}\n",
        );
        let reparsed = parse(&original.to_hocon());
        assert_eq!(original, reparsed);
    }

    #[test]
    fn strip_comments_keeps_quoted_hashes() {
        let stripped = strip_comments("a = \"x # y\" # gone\nb = 1 // gone too\n");
        assert_eq!(stripped, "a = \"x # y\" \nb = 1 \n");
    }
}
