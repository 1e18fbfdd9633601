//! Parsing of a single SQL model file.

use super::TransformError;

/// How a model is persisted in the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Materialization {
    #[default]
    View,
    Table,
}

impl Materialization {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Materialization::View => "VIEW",
            Materialization::Table => "TABLE",
        }
    }
}

/// A piece of model SQL: literal text or a placeholder to resolve at render time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Ref(String),
    Source { name: String, table: String },
    Var(String),
}

/// One `.sql` file of a transform project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlModel {
    /// File stem, unique within the project
    pub name: String,
    /// Path relative to the project root, `/`-separated
    pub path: String,
    pub materialization: Materialization,
    /// Custom schema suffix from `config(schema=...)`
    pub schema: Option<String>,
    pub segments: Vec<Segment>,
}

#[derive(Debug, PartialEq, Eq)]
enum Arg {
    Positional(String),
    Keyword(String, String),
}

impl SqlModel {
    /// Parses model SQL, splitting out every `{{ ... }}` placeholder.
    ///
    /// Placeholders inside `--` and `/* */` comments are left as plain text.
    pub fn parse(name: &str, path: &str, sql: &str) -> Result<Self, TransformError> {
        let parse_error = |message: String| TransformError::Parse {
            model: name.to_string(),
            message,
        };

        let mut model = SqlModel {
            name: name.to_string(),
            path: path.to_string(),
            materialization: Materialization::default(),
            schema: None,
            segments: Vec::new(),
        };

        let mut scanner = SqlScanner::new(sql);
        let mut text_start = 0;
        while let Some(open) = scanner.find("{{") {
            if open > text_start {
                model.segments.push(Segment::Text(sql[text_start..open].to_string()));
            }
            let after_open = &sql[open + 2..];
            let close = after_open
                .find("}}")
                .ok_or_else(|| parse_error("unterminated '{{'".to_string()))?;
            let expr = after_open[..close].trim();

            let (func, args) = parse_call(expr).map_err(&parse_error)?;
            match func.as_str() {
                "ref" => model.segments.push(Segment::Ref(single_positional(&func, &args).map_err(&parse_error)?)),
                "var" => model.segments.push(Segment::Var(single_positional(&func, &args).map_err(&parse_error)?)),
                "source" => match args.as_slice() {
                    [Arg::Positional(source), Arg::Positional(table)] => {
                        model.segments.push(Segment::Source {
                            name: source.clone(),
                            table: table.clone(),
                        })
                    }
                    _ => return Err(parse_error("source() takes two quoted arguments".to_string())),
                },
                "config" => model.apply_config(&args).map_err(&parse_error)?,
                other => return Err(parse_error(format!("unsupported placeholder '{}'", other))),
            }

            text_start = open + 2 + close + 2;
            scanner.seek(text_start);
        }
        if scanner.find("}}").is_some() {
            return Err(parse_error("stray '}}'".to_string()));
        }
        if text_start < sql.len() {
            model.segments.push(Segment::Text(sql[text_start..].to_string()));
        }

        Ok(model)
    }

    fn apply_config(&mut self, args: &[Arg]) -> Result<(), String> {
        for arg in args {
            match arg {
                Arg::Keyword(key, value) if key == "materialized" => {
                    self.materialization = match value.as_str() {
                        "view" => Materialization::View,
                        "table" => Materialization::Table,
                        other => return Err(format!("unsupported materialization '{}'", other)),
                    };
                }
                Arg::Keyword(key, value) if key == "schema" => {
                    self.schema = Some(value.clone());
                }
                Arg::Keyword(key, _) => return Err(format!("unsupported config key '{}'", key)),
                Arg::Positional(_) => {
                    return Err("config() only accepts keyword arguments".to_string())
                }
            }
        }
        Ok(())
    }

    /// Models this one references, in order of first appearance.
    pub fn refs(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Ref(name) = segment {
                if !refs.contains(&name.as_str()) {
                    refs.push(name);
                }
            }
        }
        refs
    }
}

fn single_positional(func: &str, args: &[Arg]) -> Result<String, String> {
    match args {
        [Arg::Positional(value)] => Ok(value.clone()),
        _ => Err(format!("{}() takes exactly one quoted argument", func)),
    }
}

/// Parses `name(arg, key='value', ...)` where every value is a quoted string.
fn parse_call(expr: &str) -> Result<(String, Vec<Arg>), String> {
    let open = expr
        .find('(')
        .ok_or_else(|| format!("expected a call, found '{}'", expr))?;
    if !expr.ends_with(')') {
        return Err(format!("missing ')' in '{}'", expr));
    }
    let func = expr[..open].trim().to_string();
    if func.is_empty() || !func.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("bad function name in '{}'", expr));
    }
    let inner = &expr[open + 1..expr.len() - 1];

    let mut args = Vec::new();
    for raw in split_args(inner)? {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let starts_quoted = raw.starts_with('\'') || raw.starts_with('"');
        match raw.find('=') {
            Some(eq) if !starts_quoted => {
                let key = raw[..eq].trim().to_string();
                let value = unquote(raw[eq + 1..].trim())?;
                args.push(Arg::Keyword(key, value));
            }
            _ => args.push(Arg::Positional(unquote(raw)?)),
        }
    }
    Ok((func, args))
}

fn split_args(inner: &str) -> Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match (quote, c) {
            (None, '\'') | (None, '"') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, ',') => {
                parts.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err("unterminated string literal".to_string());
    }
    parts.push(&inner[start..]);
    Ok(parts)
}

fn unquote(value: &str) -> Result<String, String> {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        Ok(value[1..value.len() - 1].to_string())
    } else {
        Err(format!("expected a quoted string, found '{}'", value))
    }
}

/// Forward scan over model SQL that ignores `--` and `/* */` comments.
///
/// Quote state carries across placeholders, so `'{{ var(..) }}'` keeps the
/// surrounding literal open and a `--` inside a literal is not a comment.
struct SqlScanner<'a> {
    sql: &'a str,
    pos: usize,
    in_string: bool,
}

impl<'a> SqlScanner<'a> {
    fn new(sql: &'a str) -> Self {
        SqlScanner {
            sql,
            pos: 0,
            in_string: false,
        }
    }

    /// Skips to `pos` without reading the bytes in between.
    fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Byte offset of the next `pattern` outside comments.
    fn find(&mut self, pattern: &str) -> Option<usize> {
        while self.pos < self.sql.len() {
            let tail = &self.sql[self.pos..];
            if tail.starts_with(pattern) {
                return Some(self.pos);
            }
            if self.in_string {
                if tail.starts_with('\'') {
                    self.in_string = false;
                }
            } else if tail.starts_with("--") {
                self.pos += tail.find('\n').unwrap_or(tail.len());
                continue;
            } else if tail.starts_with("/*") {
                self.pos += tail[2..].find("*/").map_or(tail.len(), |end| end + 4);
                continue;
            } else if tail.starts_with('\'') {
                self.in_string = true;
            }
            self.pos += tail.chars().next().map_or(1, char::len_utf8);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_sql_is_single_text_segment() {
        let model = SqlModel::parse("m", "models/m.sql", "select 1 as x").unwrap();
        assert_eq!(model.segments, vec![Segment::Text("select 1 as x".to_string())]);
        assert_eq!(model.materialization, Materialization::View);
        assert!(model.refs().is_empty());
    }

    #[test]
    fn test_placeholders_are_split_out() {
        let sql = "{{ config(materialized='table', schema=\"marts\") }}\n\
                   select * from {{ ref('stg') }} s join {{ source('coingecko', 'coins_history') }} r \
                   on s.id = r.id where d <= '{{ var('execution_date') }}'";
        let model = SqlModel::parse("mart", "models/marts/mart.sql", sql).unwrap();

        assert_eq!(model.materialization, Materialization::Table);
        assert_eq!(model.schema.as_deref(), Some("marts"));
        assert_eq!(model.refs(), vec!["stg"]);
        assert!(model.segments.contains(&Segment::Source {
            name: "coingecko".to_string(),
            table: "coins_history".to_string()
        }));
        assert!(model.segments.contains(&Segment::Var("execution_date".to_string())));
    }

    #[test]
    fn test_refs_deduplicated_in_order() {
        let sql = "select * from {{ ref('b') }} join {{ ref('a') }} join {{ ref('b') }}";
        let model = SqlModel::parse("m", "models/m.sql", sql).unwrap();
        assert_eq!(model.refs(), vec!["b", "a"]);
    }

    #[test]
    fn test_unterminated_placeholder() {
        let err = SqlModel::parse("m", "models/m.sql", "select {{ ref('a') ").unwrap_err();
        assert!(matches!(err, TransformError::Parse { .. }));
    }

    #[test]
    fn test_unsupported_placeholder() {
        let err = SqlModel::parse("m", "models/m.sql", "{{ macro_call('x') }}").unwrap_err();
        assert!(err.to_string().contains("unsupported placeholder"));
    }

    #[test]
    fn test_unknown_materialization() {
        let err =
            SqlModel::parse("m", "models/m.sql", "{{ config(materialized='incremental') }}").unwrap_err();
        assert!(err.to_string().contains("incremental"));
    }

    #[test]
    fn test_ref_requires_quoted_argument() {
        assert!(SqlModel::parse("m", "models/m.sql", "{{ ref(stg) }}").is_err());
        assert!(SqlModel::parse("m", "models/m.sql", "{{ ref('a', 'b') }}").is_err());
    }

    #[test]
    fn test_placeholders_in_comments_are_text() {
        let sql = "-- was {{ ref('old_model') }}\nselect * from {{ ref('stg') }}\n/* {{ ref('other') }} }} */ where 1 = 1";
        let model = SqlModel::parse("m", "models/m.sql", sql).unwrap();

        assert_eq!(model.refs(), vec!["stg"]);
        assert_eq!(
            model.segments[0],
            Segment::Text("-- was {{ ref('old_model') }}\nselect * from ".to_string())
        );
        assert!(matches!(model.segments.last(), Some(Segment::Text(t)) if t.contains("{{ ref('other') }}")));
    }

    #[test]
    fn test_stray_close_outside_comment() {
        assert!(SqlModel::parse("m", "models/m.sql", "select 1 -- }}\n").is_ok());
        let err = SqlModel::parse("m", "models/m.sql", "select 1 }} /* ok */").unwrap_err();
        assert!(err.to_string().contains("stray"));
    }

    #[test]
    fn test_placeholder_inside_string_literal_still_parsed() {
        let model = SqlModel::parse("m", "models/m.sql", "select '--{{ var('day') }}' as d").unwrap();
        assert!(model.segments.contains(&Segment::Var("day".to_string())));
    }

    #[test]
    fn test_commas_inside_quotes() {
        let (func, args) = parse_call("var('a,b')").unwrap();
        assert_eq!(func, "var");
        assert_eq!(args, vec![Arg::Positional("a,b".to_string())]);
    }
}
