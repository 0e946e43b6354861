//! Path expressions over parsed JSON: `$.data.items[*].title`, `items[0]`, `a.b`, `*`.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Key(String),
    Index(usize),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    steps: Vec<Step>,
    projects: bool,
}

impl JsonPath {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        let body = expr.strip_prefix('$').unwrap_or(expr);
        let mut steps = Vec::new();
        let mut cur = String::new();
        let mut chars = body.chars();

        let flush = |cur: &mut String, steps: &mut Vec<Step>| {
            if !cur.is_empty() {
                let key = std::mem::take(cur);
                steps.push(if key == "*" { Step::Wildcard } else { Step::Key(key) });
            }
        };

        while let Some(c) = chars.next() {
            match c {
                '.' => flush(&mut cur, &mut steps),
                '[' => {
                    flush(&mut cur, &mut steps);
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
                        return Err(format!("unclosed bracket in '{expr}'"));
                    }
                    let inner = inner.trim();
                    if inner == "*" {
                        steps.push(Step::Wildcard);
                    } else if let Ok(i) = inner.parse::<usize>() {
                        steps.push(Step::Index(i));
                    } else if let Some(key) = unquote(inner) {
                        steps.push(Step::Key(key.to_string()));
                    } else {
                        return Err(format!("unsupported index [{inner}] in '{expr}'"));
                    }
                }
                c => cur.push(c),
            }
        }
        flush(&mut cur, &mut steps);

        let projects = steps.iter().any(|s| *s == Step::Wildcard);
        Ok(Self { steps, projects })
    }

    /// Evaluate against `root`. Wildcard paths yield an array of every match with
    /// missing branches skipped; plain paths yield the single value or `None`.
    pub fn evaluate(&self, root: &Value) -> Option<Value> {
        let mut current: Vec<&Value> = vec![root];
        for step in &self.steps {
            let mut next = Vec::new();
            for v in current {
                match (step, v) {
                    (Step::Key(k), Value::Object(map)) => next.extend(map.get(k)),
                    (Step::Key(k), Value::Array(items)) => {
                        if let Ok(i) = k.parse::<usize>() {
                            next.extend(items.get(i));
                        }
                    }
                    (Step::Index(i), Value::Array(items)) => next.extend(items.get(*i)),
                    (Step::Wildcard, Value::Array(items)) => next.extend(items.iter()),
                    (Step::Wildcard, Value::Object(map)) => next.extend(map.values()),
                    _ => {}
                }
            }
            current = next;
        }

        if self.projects {
            Some(Value::Array(current.into_iter().cloned().collect()))
        } else {
            current.into_iter().next().cloned()
        }
    }
}

fn unquote(s: &str) -> Option<&str> {
    let first = s.chars().next()?;
    if (first == '"' || first == '\'') && s.len() >= 2 && s.ends_with(first) {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

/// Parse-and-evaluate shorthand. Invalid expressions evaluate to `None`.
pub fn select(root: &Value, expr: &str) -> Option<Value> {
    JsonPath::parse(expr).ok()?.evaluate(root)
}
