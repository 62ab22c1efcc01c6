//! Lexical analysis of script source.
//!
//! Nothing here parses or evaluates the script. The scanner only tokenizes
//! enough to find call sites, skipping comments and string literals, so it can
//! run on code that does not even compile.

use std::borrow::Cow;
use std::collections::BTreeSet;

/// Identifiers with no meaning inside the sandbox. The runtime disables the
/// same list as symbols.
pub const BANNED_IDENTIFIERS: &[&str] = &["eval", "import"];

/// A statically visible `api.<namespace>.<method>(` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCallSite {
    pub namespace: String,
    pub method: String,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BannedUse {
    pub identifier: String,
    pub line: usize,
    pub column: usize,
}

/// A `loop` / `while true` with no `break` or `return` anywhere in the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnboundedLoop {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Analysis {
    pub api_calls: Vec<ApiCallSite>,
    /// Every identifier used in method position (`.name(`)
    pub method_names: BTreeSet<String>,
    pub banned: Vec<BannedUse>,
    pub unbounded_loops: Vec<UnboundedLoop>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Punct(char),
    Literal,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    line: usize,
    column: usize,
}

struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    // Block comments nest.
    fn skip_block_comment(&mut self) {
        let mut depth = 1usize;
        while let Some(c) = self.bump() {
            match c {
                '*' if self.peek() == Some('/') => {
                    self.bump();
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                }
                '/' if self.peek() == Some('*') => {
                    self.bump();
                    depth += 1;
                }
                _ => {}
            }
        }
    }

    fn skip_quoted(&mut self, quote: char) {
        while let Some(c) = self.bump() {
            if c == '\\' {
                self.bump();
            } else if c == quote {
                return;
            }
        }
    }

    fn take_while(&mut self, first: char, pred: impl Fn(char) -> bool) -> String {
        let mut text = String::from(first);
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            text.push(c);
            self.bump();
        }
        text
    }

    fn tokens(mut self) -> Vec<Spanned> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            let (line, column) = (self.line, self.column);
            self.bump();
            let token = match c {
                c if c.is_whitespace() => continue,
                '/' if self.peek() == Some('/') => {
                    self.skip_line();
                    continue;
                }
                '/' if self.peek() == Some('*') => {
                    self.bump();
                    self.skip_block_comment();
                    continue;
                }
                '"' | '`' | '\'' => {
                    self.skip_quoted(c);
                    Token::Literal
                }
                c if c.is_alphabetic() || c == '_' => {
                    Token::Ident(self.take_while(c, |c| c.is_alphanumeric() || c == '_'))
                }
                c if c.is_ascii_digit() => {
                    self.take_while(c, |c| c.is_ascii_alphanumeric() || c == '_');
                    Token::Literal
                }
                other => Token::Punct(other),
            };
            tokens.push(Spanned {
                token,
                line,
                column,
            });
        }
        tokens
    }
}

/// Rewrite single-quoted literals that are not exactly one character
/// (`'hi'`, `''`) as double-quoted strings, so scripts written with either
/// quote style compile. One-character literals stay chars. Line numbers are
/// preserved; columns shift only on lines where an escape had to be added.
pub fn normalize_quotes(source: &str) -> Cow<'_, str> {
    if !source.contains('\'') {
        return Cow::Borrowed(source);
    }

    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut changed = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let mut depth = 0usize;
                while i < chars.len() {
                    if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                        depth += 1;
                        out.push_str("/*");
                        i += 2;
                    } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        depth -= 1;
                        out.push_str("*/");
                        i += 2;
                        if depth == 0 {
                            break;
                        }
                    } else {
                        out.push(chars[i]);
                        i += 1;
                    }
                }
            }
            '"' | '`' => {
                out.push(c);
                i += 1;
                while i < chars.len() {
                    let d = chars[i];
                    out.push(d);
                    i += 1;
                    if d == '\\' {
                        if let Some(&next) = chars.get(i) {
                            out.push(next);
                            i += 1;
                        }
                    } else if d == c {
                        break;
                    }
                }
            }
            '\'' => {
                // Find the closing quote, honouring escapes.
                let mut j = i + 1;
                let mut logical = 0usize;
                while j < chars.len() && chars[j] != '\'' && chars[j] != '\n' {
                    if chars[j] == '\\' {
                        j += 1;
                    }
                    logical += 1;
                    j += 1;
                }
                let closed = j < chars.len() && chars[j] == '\'';
                if !closed {
                    out.push(c);
                    i += 1;
                    continue;
                }
                if logical == 1 {
                    // A char literal; its closing quote must not open another.
                    out.extend(&chars[i..=j]);
                    i = j + 1;
                    continue;
                }

                out.push('"');
                let mut k = i + 1;
                while k < j {
                    match chars[k] {
                        '\\' if chars.get(k + 1) == Some(&'\'') => {
                            out.push('\'');
                            k += 2;
                        }
                        '\\' => {
                            out.push('\\');
                            if let Some(&next) = chars.get(k + 1) {
                                out.push(next);
                            }
                            k += 2;
                        }
                        '"' => {
                            out.push_str("\\\"");
                            k += 1;
                        }
                        other => {
                            out.push(other);
                            k += 1;
                        }
                    }
                }
                out.push('"');
                changed = true;
                i = j + 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    if changed {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(source)
    }
}

fn ident(tokens: &[Spanned], index: usize) -> Option<&str> {
    match tokens.get(index).map(|t| &t.token) {
        Some(Token::Ident(name)) => Some(name),
        _ => None,
    }
}

fn punct(tokens: &[Spanned], index: usize, expected: char) -> bool {
    matches!(tokens.get(index).map(|t| &t.token), Some(Token::Punct(c)) if *c == expected)
}

/// Scan `source` for call sites and risky constructs.
pub fn analyze(source: &str) -> Analysis {
    let tokens = Scanner::new(source).tokens();
    let mut analysis = Analysis::default();
    let mut loop_candidates = Vec::new();
    let mut has_exit = false;

    for (i, spanned) in tokens.iter().enumerate() {
        let Token::Ident(name) = &spanned.token else {
            continue;
        };
        let after_dot = i > 0 && punct(&tokens, i - 1, '.');

        if after_dot && punct(&tokens, i + 1, '(') {
            analysis.method_names.insert(name.clone());
        }

        if name == "api" && !after_dot && punct(&tokens, i + 1, '.') && punct(&tokens, i + 3, '.')
        {
            if let (Some(namespace), Some(method)) = (ident(&tokens, i + 2), ident(&tokens, i + 4))
            {
                if punct(&tokens, i + 5, '(') {
                    analysis.api_calls.push(ApiCallSite {
                        namespace: namespace.to_string(),
                        method: method.to_string(),
                        line: spanned.line,
                        column: spanned.column,
                    });
                }
            }
        }

        if !after_dot && BANNED_IDENTIFIERS.contains(&name.as_str()) {
            analysis.banned.push(BannedUse {
                identifier: name.clone(),
                line: spanned.line,
                column: spanned.column,
            });
        }

        match name.as_str() {
            "break" | "return" => has_exit = true,
            "loop" => loop_candidates.push((spanned.line, spanned.column)),
            "while" => {
                let bare_true = ident(&tokens, i + 1) == Some("true");
                let paren_true = punct(&tokens, i + 1, '(')
                    && ident(&tokens, i + 2) == Some("true")
                    && punct(&tokens, i + 3, ')');
                if bare_true || paren_true {
                    loop_candidates.push((spanned.line, spanned.column));
                }
            }
            _ => {}
        }
    }

    if !has_exit {
        analysis.unbounded_loops = loop_candidates
            .into_iter()
            .map(|(line, column)| UnboundedLoop { line, column })
            .collect();
    }

    analysis
}
