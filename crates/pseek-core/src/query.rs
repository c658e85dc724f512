//! Query-string mini language
//!
//! A small boolean expression language over photo metadata, used to filter
//! scored results:
//!
//! - terms are bare text (substring of caption + OCR text + filename) or
//!   `field:value` expressions
//! - operators `AND` (prec 2), `OR` (prec 1), unary `NOT` (prec 3), with
//!   parentheses as standalone tokens
//! - adjacent operands get an implicit `AND` (`sunset NOT tag:blurry`
//!   conjoins both)
//!
//! Tokens compile to RPN via shunting-yard; each photo path is evaluated by
//! folding the RPN over a stack of booleans. Compile errors (unbalanced
//! quotes or parentheses) are surfaced so the engine can fall back to a
//! bare-text filter. Unknown fields degrade to a bare-text search of the
//! token verbatim.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::collections::load_tags;
use crate::error::CoreError;
use crate::exif::load_exif;
use crate::faces::load_faces;
use crate::store::IndexStore;

const OPERATORS: [&str; 3] = ["NOT", "AND", "OR"];

/// Numeric fields accepted after `field:`.
const NUMERIC_FIELDS: [&str; 10] = [
    "iso",
    "fnumber",
    "width",
    "height",
    "mtime",
    "brightness",
    "sharpness",
    "exposure",
    "focal",
    "duration",
];

fn is_operator(token: &str) -> bool {
    OPERATORS.contains(&token.to_ascii_uppercase().as_str())
}

fn precedence(op: &str) -> u8 {
    match op {
        "NOT" => 3,
        "AND" => 2,
        "OR" => 1,
        _ => 0,
    }
}

/// Split a query into whitespace-separated tokens, preserving quoted
/// substrings (quotes are stripped). An unterminated quote is an error.
pub fn tokenize(query: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in query.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            },
        }
    }
    if quote.is_some() {
        return Err(CoreError::InvalidArgument("unterminated quote in query".into()).into());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Convert infix tokens to RPN (shunting-yard).
///
/// Operator casing is normalized, an implicit `AND` joins adjacent
/// operands, and unbalanced parentheses are an error.
pub fn to_rpn(tokens: &[String]) -> Result<Vec<String>> {
    let tokens = with_implicit_and(tokens);

    let mut output: Vec<String> = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    for token in tokens {
        if is_operator(&token) {
            let op = token.to_ascii_uppercase();
            while let Some(top) = stack.last() {
                if top != "(" && precedence(top) >= precedence(&op) {
                    output.push(stack.pop().unwrap());
                } else {
                    break;
                }
            }
            stack.push(op);
        } else if token == "(" {
            stack.push(token);
        } else if token == ")" {
            loop {
                match stack.pop() {
                    Some(top) if top == "(" => break,
                    Some(top) => output.push(top),
                    None => {
                        return Err(CoreError::InvalidArgument(
                            "unbalanced closing parenthesis".into(),
                        )
                        .into())
                    }
                }
            }
        } else {
            output.push(token);
        }
    }
    while let Some(top) = stack.pop() {
        if top == "(" {
            return Err(CoreError::InvalidArgument("unbalanced opening parenthesis".into()).into());
        }
        output.push(top);
    }
    Ok(output)
}

fn with_implicit_and(tokens: &[String]) -> Vec<String> {
    let ends_operand = |t: &str| t == ")" || (!is_operator(t) && t != "(");
    let starts_operand =
        |t: &str| t == "(" || t.eq_ignore_ascii_case("NOT") || (!is_operator(t) && t != ")");

    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    for token in tokens {
        if let Some(prev) = out.last() {
            if ends_operand(prev) && starts_operand(token) {
                out.push("AND".to_string());
            }
        }
        out.push(token.clone());
    }
    out
}

/// A compiled query expression.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    rpn: Vec<String>,
}

/// Compile a query string; errors trigger the caller's bare-text fallback.
pub fn compile(query: &str) -> Result<CompiledQuery> {
    let tokens = tokenize(query)?;
    Ok(CompiledQuery {
        rpn: to_rpn(&tokens)?,
    })
}

impl CompiledQuery {
    pub fn rpn(&self) -> &[String] {
        &self.rpn
    }

    /// Evaluate the expression for one photo path.
    ///
    /// `AND`/`OR` on an empty stack treat the missing operand as `false`;
    /// an empty expression matches everything.
    pub fn matches(&self, path: &str, ctx: &QueryContext) -> bool {
        if self.rpn.is_empty() {
            return true;
        }
        let mut stack: Vec<bool> = Vec::new();
        for token in &self.rpn {
            match token.to_ascii_uppercase().as_str() {
                "NOT" => {
                    let v = stack.pop().unwrap_or(false);
                    stack.push(!v);
                }
                "AND" | "OR" => {
                    let b = stack.pop().unwrap_or(false);
                    let a = stack.pop().unwrap_or(false);
                    stack.push(if token.eq_ignore_ascii_case("AND") {
                        a && b
                    } else {
                        a || b
                    });
                }
                _ => stack.push(evaluate_term(token, path, ctx)),
            }
        }
        stack.last().copied().unwrap_or(true)
    }
}

/// Metadata maps an expression is evaluated against.
///
/// Built once per search from the store's side tables; string keys are full
/// photo paths.
#[derive(Debug, Default)]
pub struct QueryContext {
    pub captions: HashMap<String, String>,
    pub ocr_texts: HashMap<String, String>,
    pub tags: HashMap<String, Vec<String>>,
    /// Person name → paths containing a face from a cluster so named.
    pub persons: HashMap<String, HashSet<String>>,
    /// Numeric columns (`iso`, `width`, `mtime`, …) as `path → value`.
    pub numeric: HashMap<&'static str, HashMap<String, f64>>,
    /// String columns (`camera`, `place`) as `path → value`.
    pub strings: HashMap<&'static str, HashMap<String, String>>,
}

impl QueryContext {
    /// Assemble the context from the store's side tables.
    pub fn build(store: &IndexStore) -> Result<Self> {
        let index_dir = store.index_dir();
        let state = store.state();
        let mut ctx = Self::default();

        if let Some(sidecar) = crate::captions::load_caption_texts(index_dir)? {
            ctx.captions = sidecar.paths.into_iter().zip(sidecar.texts).collect();
        }
        if let Some(sidecar) = crate::ocr::load_ocr_texts(index_dir)? {
            ctx.ocr_texts = sidecar.paths.into_iter().zip(sidecar.texts).collect();
        }
        ctx.tags = load_tags(index_dir)?.into_iter().collect();

        if let Some(faces) = load_faces(index_dir)? {
            for (cluster, name) in &faces.names {
                let entry = ctx.persons.entry(name.clone()).or_default();
                if let Some(members) = faces.clusters.get(cluster) {
                    entry.extend(members.iter().map(|(path, _)| path.clone()));
                }
            }
        }

        let mut mtimes = HashMap::new();
        for (path, &mtime) in state.paths.iter().zip(state.mtimes.iter()) {
            mtimes.insert(path.clone(), mtime);
        }
        ctx.numeric.insert("mtime", mtimes);

        if let Some(table) = load_exif(index_dir)? {
            let mut insert_numeric = |key: &'static str, values: Vec<Option<f64>>| {
                let map: HashMap<String, f64> = table
                    .paths
                    .iter()
                    .zip(values)
                    .filter_map(|(p, v)| v.map(|v| (p.clone(), v)))
                    .collect();
                ctx.numeric.insert(key, map);
            };
            insert_numeric("iso", table.iso.iter().map(|v| v.map(|x| x as f64)).collect());
            insert_numeric("fnumber", table.fnumber.clone());
            insert_numeric(
                "width",
                table.width.iter().map(|v| v.map(|x| x as f64)).collect(),
            );
            insert_numeric(
                "height",
                table.height.iter().map(|v| v.map(|x| x as f64)).collect(),
            );
            insert_numeric("brightness", table.brightness.clone());
            insert_numeric("sharpness", table.sharpness.clone());
            insert_numeric("exposure", table.exposure.clone());
            insert_numeric("focal", table.focal.clone());

            let mut insert_string = |key: &'static str, values: &[Option<String>]| {
                let map: HashMap<String, String> = table
                    .paths
                    .iter()
                    .zip(values.iter())
                    .filter_map(|(p, v)| v.clone().map(|v| (p.clone(), v)))
                    .collect();
                ctx.strings.insert(key, map);
            };
            insert_string("camera", &table.camera);
            insert_string("place", &table.place);
        }

        Ok(ctx)
    }

    /// Combined searchable document: caption + OCR text + filename.
    pub fn document_text(&self, path: &str) -> String {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!(
            "{}\n{}\n{}",
            self.captions.get(path).map(String::as_str).unwrap_or(""),
            self.ocr_texts.get(path).map(String::as_str).unwrap_or(""),
            name
        )
        .to_lowercase()
    }
}

fn evaluate_term(token: &str, path: &str, ctx: &QueryContext) -> bool {
    let Some((field, value)) = token.split_once(':') else {
        return ctx.document_text(path).contains(&token.to_lowercase());
    };
    let field = field.to_ascii_lowercase();
    let value = value.trim().trim_matches('"').trim_matches('\'');

    match field.as_str() {
        "camera" | "place" => {
            let key: &'static str = if field == "camera" { "camera" } else { "place" };
            ctx.strings
                .get(key)
                .and_then(|m| m.get(path))
                .map(|v| v.to_lowercase().contains(&value.to_lowercase()))
                .unwrap_or(false)
        }
        "tag" => ctx
            .tags
            .get(path)
            .map(|tags| tags.iter().any(|t| t == value))
            .unwrap_or(false),
        "rating" => {
            let tag = format!("rating:{value}");
            ctx.tags
                .get(path)
                .map(|tags| tags.iter().any(|t| *t == tag))
                .unwrap_or(false)
        }
        "person" => ctx
            .persons
            .get(value)
            .map(|paths| paths.contains(path))
            .unwrap_or(false),
        "has_text" => {
            let has_text = ctx
                .ocr_texts
                .get(path)
                .map(|t| !t.trim().is_empty())
                .unwrap_or(false);
            let wanted = value.is_empty()
                || matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y");
            if wanted {
                has_text
            } else {
                !has_text
            }
        }
        "filetype" => Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(value))
            .unwrap_or(false),
        f if NUMERIC_FIELDS.contains(&f) => {
            let key = NUMERIC_FIELDS
                .iter()
                .find(|&&k| k == f)
                .copied()
                .expect("checked by contains");
            evaluate_numeric(ctx.numeric.get(key), path, value)
        }
        // Unknown field: degrade to bare text over the whole token.
        _ => ctx.document_text(path).contains(&token.to_lowercase()),
    }
}

fn evaluate_numeric(column: Option<&HashMap<String, f64>>, path: &str, expr: &str) -> bool {
    let Some((op, target)) = parse_numeric_op(expr) else {
        return false;
    };
    let Some(actual) = column.and_then(|m| m.get(path)).copied() else {
        // A missing value fails any constraint.
        return false;
    };
    match op {
        ">=" => actual >= target,
        "<=" => actual <= target,
        ">" => actual > target,
        "<" => actual < target,
        _ => (actual - target).abs() < f64::EPSILON,
    }
}

fn parse_numeric_op(expr: &str) -> Option<(&'static str, f64)> {
    for op in [">=", "<=", ">", "<", "="] {
        if let Some(rest) = expr.strip_prefix(op) {
            return rest.trim().parse::<f64>().ok().map(|v| (op, v));
        }
    }
    expr.trim().parse::<f64>().ok().map(|v| ("=", v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(path: &str) -> QueryContext {
        let mut ctx = QueryContext::default();
        ctx.captions
            .insert(path.into(), "sunset over the hills".into());
        ctx.ocr_texts.insert(path.into(), "BEACH CAFE".into());
        ctx.tags.insert(path.into(), vec!["holiday".into(), "rating:5".into()]);
        ctx.strings.insert(
            "camera",
            [(path.to_string(), "Canon EOS R".to_string())].into(),
        );
        ctx.numeric
            .insert("iso", [(path.to_string(), 200.0)].into());
        ctx
    }

    #[test]
    fn test_tokenize_quotes() {
        let tokens = tokenize(r#"sunset "golden gate" 'bridge side'"#).unwrap();
        assert_eq!(tokens, vec!["sunset", "golden gate", "bridge side"]);
        assert!(tokenize(r#"sunset "oops"#).is_err());
    }

    #[test]
    fn test_rpn_spec_example() {
        let tokens = tokenize("sunset AND camera:canon AND iso:<=400 NOT tag:blurry").unwrap();
        let rpn = to_rpn(&tokens).unwrap();
        assert_eq!(
            rpn,
            vec![
                "sunset",
                "camera:canon",
                "AND",
                "iso:<=400",
                "AND",
                "tag:blurry",
                "NOT",
                "AND"
            ]
        );
    }

    #[test]
    fn test_spec_example_evaluation() {
        let path = "/p/beach.jpg";
        let ctx = ctx_with(path);
        let query = compile("sunset AND camera:canon AND iso:<=400 NOT tag:blurry").unwrap();
        assert!(query.matches(path, &ctx));

        // Same photo at ISO 800 no longer matches.
        let mut high_iso = ctx_with(path);
        high_iso.numeric.insert("iso", [(path.to_string(), 800.0)].into());
        assert!(!query.matches(path, &high_iso));

        // And a blurry tag kills it too.
        let mut blurry = ctx_with(path);
        blurry
            .tags
            .get_mut(path)
            .unwrap()
            .push("blurry".to_string());
        assert!(!query.matches(path, &blurry));
    }

    #[test]
    fn test_parentheses_and_or() {
        let path = "/p/a.jpg";
        let ctx = ctx_with(path);
        let query = compile("( beach OR mountain ) AND sunset").unwrap();
        assert!(query.matches(path, &ctx));
        let query = compile("mountain AND sunset").unwrap();
        assert!(!query.matches(path, &ctx));
    }

    #[test]
    fn test_unbalanced_parens_are_errors() {
        assert!(compile("( sunset").is_err());
        assert!(compile("sunset )").is_err());
    }

    #[test]
    fn test_field_terms() {
        let path = "/p/a.jpg";
        let ctx = ctx_with(path);
        assert!(compile("camera:canon").unwrap().matches(path, &ctx));
        assert!(compile("tag:holiday").unwrap().matches(path, &ctx));
        assert!(compile("rating:5").unwrap().matches(path, &ctx));
        assert!(!compile("rating:3").unwrap().matches(path, &ctx));
        assert!(compile("has_text:yes").unwrap().matches(path, &ctx));
        assert!(!compile("has_text:no").unwrap().matches(path, &ctx));
        assert!(compile("filetype:jpg").unwrap().matches(path, &ctx));
        assert!(compile("iso:200").unwrap().matches(path, &ctx));
        assert!(compile("iso:>100").unwrap().matches(path, &ctx));
        assert!(!compile("iso:<100").unwrap().matches(path, &ctx));
        // Missing numeric value fails the constraint.
        assert!(!compile("fnumber:<=2.8").unwrap().matches(path, &ctx));
    }

    #[test]
    fn test_unknown_field_degrades_to_bare_text() {
        let path = "/p/a.jpg";
        let mut ctx = ctx_with(path);
        ctx.captions
            .insert(path.into(), "weird label:thing here".into());
        assert!(compile("label:thing").unwrap().matches(path, &ctx));
        assert!(!compile("label:absent").unwrap().matches(path, &ctx));
    }

    #[test]
    fn test_person_term() {
        let path = "/p/a.jpg";
        let mut ctx = ctx_with(path);
        ctx.persons
            .entry("Ada".to_string())
            .or_default()
            .insert(path.to_string());
        assert!(compile("person:Ada").unwrap().matches(path, &ctx));
        assert!(!compile("person:Grace").unwrap().matches(path, &ctx));
    }

    #[test]
    fn test_empty_and_operator_only_queries() {
        let path = "/p/a.jpg";
        let ctx = ctx_with(path);
        assert!(compile("").unwrap().matches(path, &ctx));
        // Missing operands are treated as false.
        assert!(!compile("AND sunset").unwrap().matches(path, &ctx));
    }

    #[test]
    fn test_implicit_and_between_operands() {
        let path = "/p/a.jpg";
        let ctx = ctx_with(path);
        assert!(compile("sunset hills").unwrap().matches(path, &ctx));
        assert!(!compile("sunset mountain").unwrap().matches(path, &ctx));
    }

    #[test]
    fn test_parse_numeric_op() {
        assert_eq!(parse_numeric_op(">=400"), Some((">=", 400.0)));
        assert_eq!(parse_numeric_op("<2.8"), Some(("<", 2.8)));
        assert_eq!(parse_numeric_op("42"), Some(("=", 42.0)));
        assert_eq!(parse_numeric_op(">"), None);
        assert_eq!(parse_numeric_op("abc"), None);
    }
}
