use std::collections::VecDeque;
use std::iter::Peekable;
use std::str::Chars;

use log::trace;

use crate::error::{Error, Result};

/// The kind of a [`Token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// An ordinary word.
    Word,
    /// A word that began with a quote character.  Only produced in
    /// non-POSIX mode, where quotes are preserved in the token text.
    Quoted,
    /// A control operator such as `|`, `&&`, or `>>`.
    Control,
}

/// A single token produced by [`ShellLexer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// The token text.  In POSIX mode quotes are stripped and escapes
    /// processed; in non-POSIX mode the text is taken verbatim.
    pub text: String,
    /// What kind of token this is.
    pub kind: TokenKind,
    /// Whether whitespace (or the start of input) preceded this token.
    ///
    /// The parser uses this to tell `a 2> b` (fd prefix) apart from
    /// `a 2 > b` (argument `2` plus stdout redirection).
    pub space_before: bool,
}

fn is_control_char(c: char) -> bool {
    matches!(c, '(' | ')' | ';' | '&' | '|' | '<' | '>')
}

const TWO_CHAR_CONTROLS: [&str; 4] = ["&&", "||", "|&", ">>"];
const ONE_CHAR_CONTROLS: [&str; 7] = [";", "&", "|", "<", ">", "(", ")"];

/// Decompose a run of control characters into the greedy-maximal sequence of
/// valid operators.
///
/// Two-character operators are preferred over single characters at each
/// position, so `>>>>>` becomes `[">>", ">>", ">"]`, `||&` becomes
/// `["||", "&"]`, and `>&` becomes `[">", "&"]` (there is no `>&` operator).
pub fn get_valid_controls(run: &str) -> Vec<&'static str> {
    let mut out = Vec::new();
    let mut rest = run;
    while !rest.is_empty() {
        if rest.len() >= 2
            && let Some(op) = TWO_CHAR_CONTROLS.iter().find(|op| rest.starts_with(**op))
        {
            out.push(*op);
            rest = &rest[2..];
            continue;
        }
        match ONE_CHAR_CONTROLS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                out.push(*op);
                rest = &rest[1..];
            }
            // Not a control character; the lexer never produces such a run.
            None => break,
        }
    }
    out
}

/// A two-mode shell-style tokenizer.
///
/// In POSIX mode quotes are stripped from tokens and backslash escapes are
/// processed; in non-POSIX mode quoted sections are preserved verbatim and
/// the token is marked [`TokenKind::Quoted`] when it begins with a quote.
/// When `control` is true, runs of the characters `();<>|&` are folded into
/// multi-character operators (`&&`, `||`, `|&`, `>>`) by greedy longest
/// match; when it is false every such character is emitted on its own as a
/// word token.
///
/// `#` outside quotes terminates the current word and starts a comment that
/// extends to the end of the line.  Everything else that is neither
/// whitespace nor a quote is an ordinary word character, so strings like
/// `user.name@host:path`, `c:\dir\file`, `--since=1` and `0.01` lex as
/// single words.
///
/// The lexer is restartable: successive [`get_token`](Self::get_token) calls
/// yield the next token, and [`token_type`](Self::token_type) reports the
/// kind of the most recent one.
pub struct ShellLexer<'a> {
    chars: Peekable<Chars<'a>>,
    posix: bool,
    control: bool,
    pending: VecDeque<Token>,
    space: bool,
    last_kind: Option<TokenKind>,
}

impl<'a> ShellLexer<'a> {
    /// Creates a lexer over `source`.
    pub fn new(source: &'a str, posix: bool, control: bool) -> ShellLexer<'a> {
        ShellLexer {
            chars: source.chars().peekable(),
            posix,
            control,
            pending: VecDeque::new(),
            space: true,
            last_kind: None,
        }
    }

    /// Returns the kind of the most recently returned token.
    pub fn token_type(&self) -> Option<TokenKind> {
        self.last_kind
    }

    /// Returns the next token, or `None` at the end of input.
    pub fn get_token(&mut self) -> Result<Option<Token>> {
        if let Some(tok) = self.next_token()? {
            trace!("token {:?}", tok);
            self.last_kind = Some(tok.kind);
            Ok(Some(tok))
        } else {
            Ok(None)
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        if let Some(tok) = self.pending.pop_front() {
            return Ok(Some(tok));
        }
        self.skip_whitespace_and_comments();
        let Some(&c) = self.chars.peek() else {
            return Ok(None);
        };
        if is_control_char(c) {
            self.read_control_run();
            return Ok(self.pending.pop_front());
        }
        self.read_word().map(Some)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self
                .chars
                .peek()
                .is_some_and(|c| c.is_whitespace())
            {
                self.chars.next();
                self.space = true;
            }
            if self.chars.peek() == Some(&'#') {
                while let Some(c) = self.chars.next() {
                    if c == '\n' {
                        break;
                    }
                }
                self.space = true;
            } else {
                return;
            }
        }
    }

    fn read_control_run(&mut self) {
        let mut run = String::new();
        while let Some(&c) = self.chars.peek() {
            if !is_control_char(c) {
                break;
            }
            run.push(c);
            self.chars.next();
        }
        let space_before = self.space;
        self.space = false;
        if self.control {
            for (i, op) in get_valid_controls(&run).into_iter().enumerate() {
                self.pending.push_back(Token {
                    text: op.to_owned(),
                    kind: TokenKind::Control,
                    space_before: space_before && i == 0,
                });
            }
        } else {
            for (i, c) in run.chars().enumerate() {
                self.pending.push_back(Token {
                    text: c.to_string(),
                    kind: TokenKind::Word,
                    space_before: space_before && i == 0,
                });
            }
        }
    }

    fn read_word(&mut self) -> Result<Token> {
        let mut text = String::new();
        let mut kind = TokenKind::Word;
        let mut first = true;
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || is_control_char(c) || c == '#' {
                break;
            }
            match c {
                '\'' | '"' => {
                    if first && !self.posix {
                        kind = TokenKind::Quoted;
                    }
                    self.chars.next();
                    self.read_quoted(c, &mut text)?;
                }
                '\\' if self.posix => {
                    self.chars.next();
                    match self.chars.next() {
                        Some(escaped) => text.push(escaped),
                        None => return Err(Error::Parse("no escaped character".into())),
                    }
                }
                c => {
                    text.push(c);
                    self.chars.next();
                }
            }
            first = false;
        }
        let space_before = self.space;
        self.space = false;
        Ok(Token {
            text,
            kind,
            space_before,
        })
    }

    // Reads a quoted section after the opening quote has been consumed.
    fn read_quoted(&mut self, quote: char, text: &mut String) -> Result<()> {
        if !self.posix {
            text.push(quote);
        }
        loop {
            let Some(c) = self.chars.next() else {
                return Err(Error::Parse("no closing quotation".into()));
            };
            if c == quote {
                if !self.posix {
                    text.push(quote);
                }
                return Ok(());
            }
            // In POSIX mode, backslash escapes the quote character and
            // itself inside double quotes; single quotes take everything
            // literally.
            if self.posix && quote == '"' && c == '\\' {
                match self.chars.next() {
                    Some(next @ ('"' | '\\')) => text.push(next),
                    Some(next) => {
                        text.push('\\');
                        text.push(next);
                    }
                    None => return Err(Error::Parse("no closing quotation".into())),
                }
            } else {
                text.push(c);
            }
        }
    }
}

impl Iterator for ShellLexer<'_> {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Result<Token>> {
        self.get_token().transpose()
    }
}
