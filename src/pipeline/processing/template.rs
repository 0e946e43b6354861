//! Minimal runtime template engine.
//!
//! Supports `{{ expr | filter(args) }}` output tags, `{% for x in expr %}` loops and
//! `{% if [not] expr %}...{% else %}...{% endif %}` conditionals. Expressions are dotted or
//! indexed paths into a JSON context, quoted literals, numbers, or `now`.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};
use std::fmt::Write as _;
use thiserror::Error;

use crate::domain::value_to_string;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("Unclosed tag starting at offset {0}")]
    Unclosed(usize),

    #[error("Unexpected tag: {0}")]
    UnexpectedTag(String),

    #[error("Missing {0}")]
    MissingEnd(&'static str),

    #[error("Unknown filter: {0}")]
    UnknownFilter(String),

    #[error("Bad arguments for filter {filter}: {message}")]
    BadArgs { filter: String, message: String },

    #[error("Syntax error: {0}")]
    Syntax(String),
}

const FILTERS: &[&str] = &[
    "date", "add_days", "trim", "lower", "upper", "default", "replace", "truncate", "length",
    "join", "first", "last",
];

const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
enum Seg {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(Value),
    Path(Vec<Seg>),
}

#[derive(Debug, Clone, PartialEq)]
struct Filter {
    name: String,
    args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
struct Expr {
    operand: Operand,
    filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Output(Expr),
    For {
        var: String,
        iterable: Expr,
        body: Vec<Node>,
    },
    If {
        negate: bool,
        cond: Expr,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

enum Token {
    Text(String),
    Output(String),
    Tag(String),
}

/// Evaluated value: JSON, or a point in time produced by `now`.
#[derive(Debug, Clone)]
enum Val {
    Json(Value),
    Time(DateTime<Local>),
}

impl Val {
    fn render(&self) -> String {
        match self {
            Val::Json(v) => value_to_string(v),
            Val::Time(t) => t.format(DEFAULT_TIME_FORMAT).to_string(),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Val::Time(_) => true,
            Val::Json(Value::Null) => false,
            Val::Json(Value::Bool(b)) => *b,
            Val::Json(Value::String(s)) => !s.is_empty(),
            Val::Json(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            Val::Json(Value::Array(a)) => !a.is_empty(),
            Val::Json(Value::Object(o)) => !o.is_empty(),
        }
    }

    fn into_json(self) -> Value {
        match self {
            Val::Json(v) => v,
            Val::Time(t) => Value::String(t.format(DEFAULT_TIME_FORMAT).to_string()),
        }
    }
}

/// A parsed template, reusable across renders.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(src: &str) -> Result<Self, TemplateError> {
        let tokens = tokenize(src)?;
        let mut iter = tokens.into_iter();
        let (nodes, end) = parse_block(&mut iter, &[])?;
        if let Some(tag) = end {
            return Err(TemplateError::UnexpectedTag(tag));
        }
        Ok(Self { nodes })
    }

    pub fn render(&self, ctx: &Value) -> Result<String, TemplateError> {
        self.render_at(ctx, Local::now())
    }

    pub fn render_at(&self, ctx: &Value, now: DateTime<Local>) -> Result<String, TemplateError> {
        let mut scope = Scope {
            root: ctx,
            locals: Vec::new(),
            now,
        };
        let mut out = String::new();
        render_nodes(&self.nodes, &mut scope, &mut out)?;
        Ok(out)
    }
}

/// Parse and render in one go.
pub fn render(src: &str, ctx: &Value) -> Result<String, TemplateError> {
    Template::parse(src)?.render(ctx)
}

pub fn has_markup(src: &str) -> bool {
    src.contains("{{") || src.contains("{%")
}

/// Field transforms: a string without markup is a plain variable lookup and keeps the
/// value's JSON type; anything else renders to a string.
pub fn render_transform(src: &str, ctx: &Value) -> Result<Value, TemplateError> {
    if has_markup(src) {
        return render(src, ctx).map(Value::String);
    }
    let path = parse_path(src.trim())?;
    let scope = Scope {
        root: ctx,
        locals: Vec::new(),
        now: Local::now(),
    };
    Ok(scope.lookup(&path).map(Val::into_json).unwrap_or(Value::Null))
}

fn tokenize(src: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut rest = src;
    let mut offset = 0;
    loop {
        let next = match (rest.find("{{"), rest.find("{%")) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let Some(pos) = next else {
            if !rest.is_empty() {
                tokens.push(Token::Text(rest.to_string()));
            }
            break;
        };
        if pos > 0 {
            tokens.push(Token::Text(rest[..pos].to_string()));
        }
        let is_output = rest[pos..].starts_with("{{");
        let close = if is_output { "}}" } else { "%}" };
        let inner_start = pos + 2;
        let end = rest[inner_start..]
            .find(close)
            .ok_or(TemplateError::Unclosed(offset + pos))?;
        let inner = rest[inner_start..inner_start + end].trim().to_string();
        tokens.push(if is_output {
            Token::Output(inner)
        } else {
            Token::Tag(inner)
        });
        let consumed = inner_start + end + 2;
        rest = &rest[consumed..];
        offset += consumed;
    }
    Ok(tokens)
}

fn parse_block(
    iter: &mut std::vec::IntoIter<Token>,
    terminators: &[&str],
) -> Result<(Vec<Node>, Option<String>), TemplateError> {
    let mut nodes = Vec::new();
    while let Some(token) = iter.next() {
        match token {
            Token::Text(t) => nodes.push(Node::Text(t)),
            Token::Output(e) => nodes.push(Node::Output(parse_expr(&e)?)),
            Token::Tag(tag) => {
                let keyword = tag.split_whitespace().next().unwrap_or("").to_string();
                if terminators.contains(&keyword.as_str()) {
                    return Ok((nodes, Some(keyword)));
                }
                match keyword.as_str() {
                    "for" => nodes.push(parse_for(&tag, iter)?),
                    "if" => nodes.push(parse_if(&tag, iter)?),
                    _ => return Err(TemplateError::UnexpectedTag(tag)),
                }
            }
        }
    }
    Ok((nodes, None))
}

fn parse_for(tag: &str, iter: &mut std::vec::IntoIter<Token>) -> Result<Node, TemplateError> {
    let header = tag["for".len()..].trim();
    let (var, rest) = header
        .split_once(char::is_whitespace)
        .ok_or_else(|| TemplateError::Syntax(format!("bad for tag: {tag}")))?;
    let iterable = rest
        .trim()
        .strip_prefix("in ")
        .ok_or_else(|| TemplateError::Syntax(format!("bad for tag: {tag}")))?;
    let iterable = parse_expr(iterable)?;
    let (body, end) = parse_block(iter, &["endfor"])?;
    if end.is_none() {
        return Err(TemplateError::MissingEnd("endfor"));
    }
    Ok(Node::For {
        var: var.to_string(),
        iterable,
        body,
    })
}

fn parse_if(tag: &str, iter: &mut std::vec::IntoIter<Token>) -> Result<Node, TemplateError> {
    let mut cond = tag["if".len()..].trim();
    let mut negate = false;
    if let Some(rest) = cond.strip_prefix("not ") {
        negate = true;
        cond = rest.trim();
    }
    let cond = parse_expr(cond)?;
    let (then, end) = parse_block(iter, &["else", "endif"])?;
    let otherwise = match end.as_deref() {
        Some("endif") => Vec::new(),
        Some("else") => {
            let (otherwise, end) = parse_block(iter, &["endif"])?;
            if end.is_none() {
                return Err(TemplateError::MissingEnd("endif"));
            }
            otherwise
        }
        _ => return Err(TemplateError::MissingEnd("endif")),
    };
    Ok(Node::If {
        negate,
        cond,
        then,
        otherwise,
    })
}

/// Split on `sep` outside quotes and parentheses.
fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    for c in s.chars() {
        match quote {
            Some(q) => {
                cur.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    cur.push(c);
                }
                '(' => {
                    depth += 1;
                    cur.push(c);
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    cur.push(c);
                }
                c if c == sep && depth == 0 => parts.push(std::mem::take(&mut cur)),
                c => cur.push(c),
            },
        }
    }
    parts.push(cur);
    parts
}

fn parse_expr(s: &str) -> Result<Expr, TemplateError> {
    let mut parts = split_top_level(s, '|').into_iter();
    let head = parts.next().unwrap_or_default();
    let operand = parse_operand(head.trim())?;
    let filters = parts
        .map(|p| parse_filter(p.trim()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Expr { operand, filters })
}

fn parse_operand(s: &str) -> Result<Operand, TemplateError> {
    if s.is_empty() {
        return Err(TemplateError::Syntax("empty expression".into()));
    }
    if let Some(lit) = parse_literal(s) {
        return Ok(Operand::Literal(lit));
    }
    Ok(Operand::Path(parse_path(s)?))
}

fn parse_literal(s: &str) -> Option<Value> {
    let first = s.chars().next()?;
    if (first == '"' || first == '\'') && s.len() >= 2 && s.ends_with(first) {
        return Some(Value::String(s[1..s.len() - 1].replace("\\n", "\n")));
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    if let Ok(f) = s.parse::<f64>() {
        return Some(Value::from(f));
    }
    match s {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        "none" | "null" => Some(Value::Null),
        _ => None,
    }
}

fn parse_path(s: &str) -> Result<Vec<Seg>, TemplateError> {
    let mut segs = Vec::new();
    let mut cur = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !cur.is_empty() {
                    segs.push(Seg::Key(std::mem::take(&mut cur)));
                }
            }
            '[' => {
                if !cur.is_empty() {
                    segs.push(Seg::Key(std::mem::take(&mut cur)));
                }
                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return Err(TemplateError::Syntax(format!("unclosed bracket in {s}")));
                }
                let inner = inner.trim();
                match parse_literal(inner) {
                    Some(Value::String(key)) => segs.push(Seg::Key(key)),
                    Some(Value::Number(n)) if n.as_u64().is_some() => {
                        segs.push(Seg::Index(n.as_u64().unwrap_or_default() as usize))
                    }
                    _ => return Err(TemplateError::Syntax(format!("bad index [{inner}] in {s}"))),
                }
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' => cur.push(c),
            c => return Err(TemplateError::Syntax(format!("unexpected '{c}' in {s}"))),
        }
    }
    if !cur.is_empty() {
        segs.push(Seg::Key(cur));
    }
    if segs.is_empty() {
        return Err(TemplateError::Syntax(format!("empty path: {s}")));
    }
    Ok(segs)
}

fn parse_filter(s: &str) -> Result<Filter, TemplateError> {
    let (name, args) = match s.find('(') {
        Some(open) => {
            let close = s
                .rfind(')')
                .filter(|c| *c > open)
                .ok_or_else(|| TemplateError::Syntax(format!("unclosed filter call: {s}")))?;
            (s[..open].trim(), Some(&s[open + 1..close]))
        }
        None => (s.trim(), None),
    };
    if !FILTERS.contains(&name) {
        return Err(TemplateError::UnknownFilter(name.to_string()));
    }
    let args = match args {
        Some(a) if !a.trim().is_empty() => split_top_level(a, ',')
            .into_iter()
            .map(|arg| {
                parse_literal(arg.trim()).ok_or_else(|| TemplateError::BadArgs {
                    filter: name.to_string(),
                    message: format!("unsupported argument {}", arg.trim()),
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };
    Ok(Filter {
        name: name.to_string(),
        args,
    })
}

struct Scope<'a> {
    root: &'a Value,
    locals: Vec<(String, Value)>,
    now: DateTime<Local>,
}

impl Scope<'_> {
    fn lookup(&self, path: &[Seg]) -> Option<Val> {
        let (first, rest) = path.split_first()?;
        let Seg::Key(name) = first else {
            return descend(self.root, path).cloned().map(Val::Json);
        };
        if let Some((_, v)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            return descend(v, rest).cloned().map(Val::Json);
        }
        if let Some(v) = self.root.get(name.as_str()) {
            return descend(v, rest).cloned().map(Val::Json);
        }
        if name == "now" && rest.is_empty() {
            return Some(Val::Time(self.now));
        }
        None
    }

    fn eval(&self, expr: &Expr) -> Result<Val, TemplateError> {
        let mut val = match &expr.operand {
            Operand::Literal(v) => Val::Json(v.clone()),
            Operand::Path(p) => self.lookup(p).unwrap_or(Val::Json(Value::Null)),
        };
        for filter in &expr.filters {
            val = apply_filter(val, filter)?;
        }
        Ok(val)
    }
}

fn descend<'v>(mut v: &'v Value, path: &[Seg]) -> Option<&'v Value> {
    for seg in path {
        v = match (seg, v) {
            (Seg::Key(k), Value::Object(map)) => map.get(k)?,
            (Seg::Key(k), Value::Array(items)) => items.get(k.parse::<usize>().ok()?)?,
            (Seg::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(v)
}

fn arg_str<'a>(filter: &'a Filter, i: usize) -> Result<&'a str, TemplateError> {
    filter
        .args
        .get(i)
        .and_then(|v| v.as_str())
        .ok_or_else(|| TemplateError::BadArgs {
            filter: filter.name.clone(),
            message: format!("argument {} must be a string", i + 1),
        })
}

fn arg_i64(filter: &Filter, i: usize) -> Result<i64, TemplateError> {
    filter
        .args
        .get(i)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| TemplateError::BadArgs {
            filter: filter.name.clone(),
            message: format!("argument {} must be an integer", i + 1),
        })
}

fn format_time(t: &DateTime<Local>, fmt: &str, filter: &Filter) -> Result<String, TemplateError> {
    let mut out = String::new();
    write!(out, "{}", t.format(fmt)).map_err(|_| TemplateError::BadArgs {
        filter: filter.name.clone(),
        message: format!("invalid format {fmt}"),
    })?;
    Ok(out)
}

fn parse_time(s: &str) -> Option<DateTime<Local>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Local));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, DEFAULT_TIME_FORMAT) {
        return t.and_local_timezone(Local).single();
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|t| t.and_local_timezone(Local).single())
}

fn apply_filter(val: Val, filter: &Filter) -> Result<Val, TemplateError> {
    let text = |v: &Val| v.render();
    Ok(match filter.name.as_str() {
        "date" => {
            let fmt = arg_str(filter, 0)?;
            let time = match &val {
                Val::Time(t) => Some(*t),
                Val::Json(Value::String(s)) => parse_time(s),
                _ => None,
            };
            match time {
                Some(t) => Val::Json(Value::String(format_time(&t, fmt, filter)?)),
                None => val,
            }
        }
        "add_days" => {
            let days = arg_i64(filter, 0)?;
            match val {
                Val::Time(t) => ChronoDuration::try_days(days)
                    .and_then(|d| t.checked_add_signed(d))
                    .map(Val::Time)
                    .ok_or_else(|| TemplateError::BadArgs {
                        filter: filter.name.clone(),
                        message: format!("{days} days is out of range"),
                    })?,
                other => other,
            }
        }
        "trim" => Val::Json(Value::String(text(&val).trim().to_string())),
        "lower" => Val::Json(Value::String(text(&val).to_lowercase())),
        "upper" => Val::Json(Value::String(text(&val).to_uppercase())),
        "default" => {
            if val.truthy() {
                val
            } else {
                Val::Json(filter.args.first().cloned().unwrap_or(Value::Null))
            }
        }
        "replace" => {
            let from = arg_str(filter, 0)?;
            let to = arg_str(filter, 1)?;
            Val::Json(Value::String(text(&val).replace(from, to)))
        }
        "truncate" => {
            let max = arg_i64(filter, 0)?.max(0) as usize;
            let s = text(&val);
            if s.chars().count() > max {
                let cut: String = s.chars().take(max).collect();
                Val::Json(Value::String(format!("{cut}...")))
            } else {
                Val::Json(Value::String(s))
            }
        }
        "length" => {
            let n = match &val {
                Val::Json(Value::Array(a)) => a.len(),
                Val::Json(Value::Object(o)) => o.len(),
                Val::Json(Value::Null) => 0,
                other => text(other).chars().count(),
            };
            Val::Json(Value::from(n))
        }
        "join" => {
            let sep = match filter.args.first() {
                Some(_) => arg_str(filter, 0)?,
                None => "",
            };
            match val {
                Val::Json(Value::Array(items)) => Val::Json(Value::String(
                    items.iter().map(value_to_string).collect::<Vec<_>>().join(sep),
                )),
                other => other,
            }
        }
        "first" | "last" => {
            let pick_last = filter.name == "last";
            match val {
                Val::Json(Value::Array(items)) => {
                    let item = if pick_last { items.last() } else { items.first() };
                    Val::Json(item.cloned().unwrap_or(Value::Null))
                }
                Val::Json(Value::String(s)) => {
                    let c = if pick_last { s.chars().last() } else { s.chars().next() };
                    Val::Json(c.map(|c| Value::String(c.to_string())).unwrap_or(Value::Null))
                }
                other => other,
            }
        }
        other => return Err(TemplateError::UnknownFilter(other.to_string())),
    })
}

fn render_nodes(nodes: &[Node], scope: &mut Scope<'_>, out: &mut String) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Output(expr) => out.push_str(&scope.eval(expr)?.render()),
            Node::If {
                negate,
                cond,
                then,
                otherwise,
            } => {
                let truthy = scope.eval(cond)?.truthy() != *negate;
                render_nodes(if truthy { then } else { otherwise }, scope, out)?;
            }
            Node::For {
                var,
                iterable,
                body,
            } => {
                let items: Vec<Value> = match scope.eval(iterable)?.into_json() {
                    Value::Array(items) => items,
                    Value::Object(map) => map
                        .into_iter()
                        .map(|(k, v)| {
                            let mut entry = Map::new();
                            entry.insert("key".into(), Value::String(k));
                            entry.insert("value".into(), v);
                            Value::Object(entry)
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                let total = items.len();
                for (i, item) in items.into_iter().enumerate() {
                    let mut meta = Map::new();
                    meta.insert("index".into(), Value::from(i + 1));
                    meta.insert("first".into(), Value::Bool(i == 0));
                    meta.insert("last".into(), Value::Bool(i + 1 == total));
                    scope.locals.push(("loop".into(), Value::Object(meta)));
                    scope.locals.push((var.clone(), item));
                    let result = render_nodes(body, scope, out);
                    scope.locals.pop();
                    scope.locals.pop();
                    result?;
                }
            }
        }
    }
    Ok(())
}
