//! Dependency reader: parses a `DEPS` manifest into pinned git revisions.
//!
//! `DEPS` is a Python-literal file. The subset understood here covers what
//! real manifests use: assignments of string, number, boolean, `None`,
//! list and dict literals; adjacent and `+` string concatenation;
//! `Var('name')`, `Str('..')` and `{name}` substitution from `vars`; and
//! `#` comments.
//!
//! Only git dependencies hosted on a domain are returned. Binary-package
//! (`cipd`, `gcs`) pins cannot be bisected by commit range and are dropped.

use std::collections::HashMap;

use crate::domain::{BisectError, Result};
use crate::source::SourceRepo;

/// Path of the manifest within a repository.
pub const DEPS_FILE: &str = "DEPS";

/// Pinned dependency revisions at one commit, in manifest order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyManifest {
    entries: Vec<(String, String)>,
}

impl DependencyManifest {
    /// Pinned revision for a dependency URL (`https://host/path`).
    pub fn get(&self, url: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == url)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First dependency, in this manifest's order, that `other` pins to a
    /// different revision. Dependencies missing from `other` are skipped.
    pub fn first_rolled<'a>(&'a self, other: &DependencyManifest) -> Option<(&'a str, &'a str)> {
        self.iter().find(|(url, rev)| {
            other
                .get(url)
                .is_some_and(|other_rev| other_rev != *rev)
        })
    }
}

/// Read and parse `DEPS` at `revision`.
pub async fn fetch_git_deps(repo: &dyn SourceRepo, revision: &str) -> Result<DependencyManifest> {
    let raw = repo
        .read_file_at_ref(DEPS_FILE, revision)
        .await
        .map_err(|e| BisectError::ManifestFetch {
            repository_url: repo.url().to_string(),
            revision: revision.to_string(),
            path: DEPS_FILE.to_string(),
            reason: e.to_string(),
        })?;

    let parse_err = |reason: String| BisectError::ManifestParse {
        repository_url: repo.url().to_string(),
        revision: revision.to_string(),
        reason,
    };
    let text = String::from_utf8(raw).map_err(|e| parse_err(e.to_string()))?;
    parse_deps(&text).map_err(parse_err)
}

/// Parse `DEPS` content into a manifest of git dependencies.
pub fn parse_deps(content: &str) -> std::result::Result<DependencyManifest, String> {
    let tokens = tokenize(content)?;
    let scope = Parser::new(tokens).program()?;

    let vars = match scope.get("vars") {
        Some(Value::Dict(v)) => v.clone(),
        _ => Vec::new(),
    };
    let deps = match scope.get("deps") {
        Some(Value::Dict(d)) => d,
        Some(_) => return Err("deps is not a dict".to_string()),
        None => return Ok(DependencyManifest::default()),
    };

    let mut entries = Vec::new();
    for (path, entry) in deps {
        let url_rev = match entry {
            Value::Str(s) => s.clone(),
            Value::Dict(fields) => {
                let field = |name: &str| fields.iter().find(|(k, _)| k == name).map(|(_, v)| v);
                if let Some(Value::Str(dep_type)) = field("dep_type") {
                    if dep_type != "git" {
                        continue;
                    }
                }
                match field("url") {
                    Some(Value::Str(s)) => s.clone(),
                    _ => continue,
                }
            }
            _ => continue,
        };
        let url_rev = substitute(&url_rev, &vars)
            .map_err(|e| format!("deps entry {path:?}: {e}"))?;
        let Some((url, rev)) = url_rev.rsplit_once('@') else {
            continue;
        };
        let id = dependency_id(url);
        if rev.is_empty() || !is_source_host(&id) {
            continue;
        }
        let key = format!("https://{id}");
        if !entries.iter().any(|(k, _): &(String, String)| *k == key) {
            entries.push((key, rev.to_string()));
        }
    }
    Ok(DependencyManifest { entries })
}

/// `https://host/path.git` -> `host/path`.
fn dependency_id(url: &str) -> String {
    let no_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let trimmed = no_scheme.trim_end_matches('/');
    trimmed.strip_suffix(".git").unwrap_or(trimmed).to_string()
}

/// Host part looks like `label.tld`.
fn is_source_host(id: &str) -> bool {
    let host = id.split('/').next().unwrap_or("");
    let Some((name, tld)) = host.rsplit_once('.') else {
        return false;
    };
    !name.is_empty() && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// Replace `{name}` with the value of `name` in `vars`.
fn substitute(s: &str, vars: &[(String, Value)]) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| format!("unterminated {{ in {s:?}"))?;
        let name = &after[..close];
        let value = vars
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
            .ok_or_else(|| format!("undefined var {name:?}"))?;
        out.push_str(&value.as_text()?);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
    None,
    List(Vec<Value>),
    /// Ordered; DEPS order matters for roll detection.
    Dict(Vec<(String, Value)>),
}

impl Value {
    fn as_text(&self) -> std::result::Result<String, String> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            Value::Num(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(if *b { "True" } else { "False" }.to_string()),
            other => Err(format!("cannot format {other:?} as text")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(f64),
    Ident(String),
    Punct(char),
}

fn tokenize(src: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() || c == '\\' => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\'' | '"' => {
                let triple = i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c;
                let (s, next) = if triple {
                    read_triple(&chars, i + 3, c)?
                } else {
                    read_string(&chars, i + 1, c)?
                };
                tokens.push(Token::Str(s));
                i = next;
            }
            '{' | '}' | '[' | ']' | '(' | ')' | ':' | ',' | '=' | '+' => {
                tokens.push(Token::Punct(c));
                i += 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse()
                    .map_err(|_| format!("bad number literal {text:?}"))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

fn read_string(chars: &[char], mut i: usize, quote: char) -> std::result::Result<(String, usize), String> {
    let mut s = String::new();
    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((s, i + 1)),
            '\n' => break,
            '\\' if i + 1 < chars.len() => {
                s.push(match chars[i + 1] {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                i += 2;
            }
            c => {
                s.push(c);
                i += 1;
            }
        }
    }
    Err("unterminated string literal".to_string())
}

fn read_triple(chars: &[char], mut i: usize, quote: char) -> std::result::Result<(String, usize), String> {
    let mut s = String::new();
    while i < chars.len() {
        if chars[i] == quote && chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
            return Ok((s, i + 3));
        }
        s.push(chars[i]);
        i += 1;
    }
    Err("unterminated triple-quoted string".to_string())
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    scope: HashMap<String, Value>,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            scope: HashMap::new(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(&Token::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> std::result::Result<(), String> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(format!("expected {c:?}, found {:?}", self.peek()))
        }
    }

    fn program(mut self) -> std::result::Result<HashMap<String, Value>, String> {
        while let Some(token) = self.next() {
            let Token::Ident(name) = token else {
                return Err(format!("expected assignment, found {token:?}"));
            };
            self.expect('=')?;
            let value = self.expr()?;
            self.scope.insert(name, value);
        }
        Ok(self.scope)
    }

    fn expr(&mut self) -> std::result::Result<Value, String> {
        let mut value = self.term()?;
        while self.eat('+') {
            let rhs = self.term()?;
            value = match (value, rhs) {
                (Value::Str(a), Value::Str(b)) => Value::Str(a + &b),
                (Value::Num(a), Value::Num(b)) => Value::Num(a + b),
                (Value::List(mut a), Value::List(b)) => {
                    a.extend(b);
                    Value::List(a)
                }
                (a, b) => return Err(format!("cannot add {a:?} and {b:?}")),
            };
        }
        Ok(value)
    }

    fn term(&mut self) -> std::result::Result<Value, String> {
        match self.next() {
            Some(Token::Str(mut s)) => {
                while let Some(Token::Str(more)) = self.peek() {
                    s.push_str(more);
                    self.pos += 1;
                }
                Ok(Value::Str(s))
            }
            Some(Token::Num(n)) => Ok(Value::Num(n)),
            Some(Token::Ident(name)) => match name.as_str() {
                "True" => Ok(Value::Bool(true)),
                "False" => Ok(Value::Bool(false)),
                "None" => Ok(Value::None),
                "Var" => {
                    let var = self.call_arg()?;
                    self.lookup_var(&var)
                }
                "Str" => Ok(Value::Str(self.call_arg()?)),
                other => self
                    .scope
                    .get(other)
                    .cloned()
                    .ok_or_else(|| format!("undefined name {other:?}")),
            },
            Some(Token::Punct('{')) => self.dict(),
            Some(Token::Punct('[')) => self.sequence(']'),
            Some(Token::Punct('(')) => {
                let items = self.sequence(')')?;
                match items {
                    Value::List(mut v) if v.len() == 1 => Ok(v.remove(0)),
                    other => Ok(other),
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn call_arg(&mut self) -> std::result::Result<String, String> {
        self.expect('(')?;
        let arg = match self.expr()? {
            Value::Str(s) => s,
            other => return Err(format!("expected string argument, found {other:?}")),
        };
        self.expect(')')?;
        Ok(arg)
    }

    fn lookup_var(&self, name: &str) -> std::result::Result<Value, String> {
        let Some(Value::Dict(vars)) = self.scope.get("vars") else {
            return Err(format!("Var({name:?}) used before vars is defined"));
        };
        vars.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| format!("undefined var {name:?}"))
    }

    fn dict(&mut self) -> std::result::Result<Value, String> {
        let mut entries = Vec::new();
        loop {
            if self.eat('}') {
                return Ok(Value::Dict(entries));
            }
            let key = match self.expr()? {
                Value::Str(s) => s,
                other => return Err(format!("dict key must be a string, found {other:?}")),
            };
            self.expect(':')?;
            let value = self.expr()?;
            entries.push((key, value));
            if !self.eat(',') {
                self.expect('}')?;
                return Ok(Value::Dict(entries));
            }
        }
    }

    fn sequence(&mut self, close: char) -> std::result::Result<Value, String> {
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Ok(Value::List(items));
            }
            items.push(self.expr()?);
            if !self.eat(',') {
                self.expect(close)?;
                return Ok(Value::List(items));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROMIUM_DEPS: &str = r#"
# Chromium DEPS excerpt.
use_relative_paths = False

vars = {
  'chromium_git': 'https://chromium.googlesource.com',
  'skia_git': 'https://skia.googlesource.com',
  'v8_revision': 'a5b1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9',
  'skia_revision': '0123456789abcdef0123456789abcdef01234567',
  'checkout_android': False,
  'build_number': 42,
}

deps = {
  'src/v8':
    Var('chromium_git') + '/v8/v8.git' + '@' + Var('v8_revision'),
  'src/third_party/skia':
    Var('skia_git') + '/skia.git' + '@' + Var('skia_revision'),
  'src/third_party/catapult': {
    'url': '{chromium_git}/catapult.git@ffeeddccbbaa',
    'condition': 'checkout_android',
  },
  'src/third_party/android_sdk': {
    'packages': [
      {
        'package': 'chromium/third_party/android_sdk/public/platforms',
        'version': 'version:2@34',
      },
    ],
    'condition': 'checkout_android',
    'dep_type': 'cipd',
  },
  'src/third_party/unpinned': Var('chromium_git') + '/unpinned.git',
  'src/local': 'local_mirror/foo@1234',
}

hooks = [
  {
    'name': 'lastchange',
    'pattern': '.',
    'action': ['python3', 'src/build/util/lastchange.py', '-o', 'src/build/util/LASTCHANGE'],
  },
]
"#;

    #[test]
    fn parses_git_deps_in_order() {
        let manifest = parse_deps(CHROMIUM_DEPS).unwrap();
        let urls: Vec<&str> = manifest.iter().map(|(k, _)| k).collect();
        assert_eq!(
            urls,
            vec![
                "https://chromium.googlesource.com/v8/v8",
                "https://skia.googlesource.com/skia",
                "https://chromium.googlesource.com/catapult",
            ]
        );
        assert_eq!(
            manifest.get("https://chromium.googlesource.com/v8/v8"),
            Some("a5b1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9")
        );
        assert_eq!(
            manifest.get("https://chromium.googlesource.com/catapult"),
            Some("ffeeddccbbaa")
        );
    }

    #[test]
    fn cipd_and_unpinned_entries_are_skipped() {
        let manifest = parse_deps(CHROMIUM_DEPS).unwrap();
        assert!(manifest.iter().all(|(k, _)| !k.contains("android_sdk")));
        assert!(manifest.iter().all(|(k, _)| !k.contains("unpinned")));
        assert!(manifest.iter().all(|(k, _)| !k.contains("local_mirror")));
    }

    #[test]
    fn adjacent_strings_and_str_concatenate() {
        let manifest = parse_deps(
            "deps = { 'src/a': 'https://example.com/' 'a.git' + Str('@abc') }",
        )
        .unwrap();
        assert_eq!(manifest.get("https://example.com/a"), Some("abc"));
    }

    #[test]
    fn first_rolled_uses_start_manifest_order() {
        let start = parse_deps(
            "deps = { 'a': 'https://x.com/a@1', 'b': 'https://x.com/b@1', 'c': 'https://x.com/c@1' }",
        )
        .unwrap();
        let end = parse_deps("deps = { 'c': 'https://x.com/c@2', 'b': 'https://x.com/b@2' }").unwrap();
        assert_eq!(start.first_rolled(&end), Some(("https://x.com/b", "1")));
        assert_eq!(start.first_rolled(&start), None);
    }

    #[test]
    fn undefined_var_is_a_parse_error() {
        let err = parse_deps("vars = {}\ndeps = { 'a': Var('nope') }").unwrap_err();
        assert!(err.contains("nope"));
        let err = parse_deps("deps = { 'a': '{nope}/a.git@1' }").unwrap_err();
        assert!(err.contains("nope"));
    }

    #[test]
    fn malformed_content_is_rejected() {
        assert!(parse_deps("deps = { 'a': ").is_err());
        assert!(parse_deps("deps = { 'a': 'unterminated }").is_err());
        assert!(parse_deps("this is not python").is_err());
    }

    #[test]
    fn missing_deps_is_empty() {
        assert!(parse_deps("vars = { 'x': 'y' }").unwrap().is_empty());
    }
}
