use std::fmt;

use log::debug;

use crate::error::{Error, Result};
use crate::lex::{ShellLexer, Token, TokenKind, get_valid_controls};

/// A redirection operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOp {
    /// `<`
    Read,
    /// `>`
    Write,
    /// `>>`
    Append,
}

impl fmt::Display for RedirectOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RedirectOp::Read => "<",
            RedirectOp::Write => ">",
            RedirectOp::Append => ">>",
        })
    }
}

/// The target of a redirection: a file name, or another file descriptor as
/// in `2>&1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectTarget {
    /// Redirect to the named file.
    File(String),
    /// Duplicate the given file descriptor.
    Fd(i32),
}

/// A single redirection attached to a command or group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// The file descriptor being redirected.
    pub fd: i32,
    /// The operator.
    pub op: RedirectOp,
    /// The target.
    pub target: RedirectTarget,
}

/// One pipeline stage: a command with its redirections.
///
/// Redirections are kept in source order because the order is significant
/// when fd-duplication targets refer to each other, as in
/// `3>&1 1>&2 2>&3`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    /// The command and its arguments.
    pub command: Vec<String>,
    /// The redirections, in source order.
    pub redirects: Vec<Redirect>,
}

impl Node {
    /// Returns the redirection of `fd`, if there is one.
    pub fn redirect(&self, fd: i32) -> Option<&Redirect> {
        self.redirects.iter().find(|r| r.fd == fd)
    }
}

/// The operator joining two parts of a parsed command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// `|`
    Pipe,
    /// `|&`: like `|`, but the left stage's stderr is connected to the
    /// same pipe as its stdout
    PipeBoth,
    /// `;`
    Seq,
    /// `&` with a following part: the left side runs in the background
    /// while execution continues with the right side
    BgSeq,
    /// `&&`
    And,
    /// `||`
    Or,
}

/// A parsed command line.
///
/// Leaves are [`Node`]s; interior nodes join their operands with a
/// [`Connector`].  A parenthesised group carries its own redirections,
/// which apply to every command inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// A simple command.
    Cmd(Node),
    /// A parenthesised group with its redirections.
    Group(Box<CommandLine>, Vec<Redirect>),
    /// Two parts joined by an operator.
    Connection {
        /// The joining operator.
        op: Connector,
        /// The left operand.
        left: Box<CommandLine>,
        /// The right operand.
        right: Box<CommandLine>,
    },
    /// A part followed by a trailing `&`.
    Background(Box<CommandLine>),
}

impl CommandLine {
    /// Returns the underlying [`Node`] if the whole command line is a single
    /// simple command.
    pub fn node(&self) -> Option<&Node> {
        match self {
            CommandLine::Cmd(node) => Some(node),
            _ => None,
        }
    }

    /// The number of simple commands in this tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            CommandLine::Cmd(_) => 1,
            CommandLine::Group(body, _) => body.leaf_count(),
            CommandLine::Connection { left, right, .. } => {
                left.leaf_count() + right.leaf_count()
            }
            CommandLine::Background(body) => body.leaf_count(),
        }
    }

    // The redirects of the stage a pipe would connect on this side: for a
    // nested pipe as the left operand, those of its last stage.
    fn pipe_stage_redirects(&self) -> &[Redirect] {
        match self {
            CommandLine::Cmd(node) => &node.redirects,
            CommandLine::Group(_, redirects) => redirects,
            CommandLine::Connection {
                op: Connector::Pipe | Connector::PipeBoth,
                right,
                ..
            } => right.pipe_stage_redirects(),
            // The grammar only produces commands, groups and pipes at
            // stage level.
            _ => unreachable!("pipe operand is not a stage"),
        }
    }
}

fn has_file_redirect(redirects: &[Redirect], fd: i32) -> bool {
    redirects
        .iter()
        .any(|r| r.fd == fd && matches!(r.target, RedirectTarget::File(_)))
}

/// Parses a shell-like command line into a [`CommandLine`] tree.
///
/// With `posix` true, quotes are stripped from words and escapes are
/// processed; with `posix` false, quoted sections are preserved verbatim in
/// the parsed words.
///
/// All syntax errors -- unbalanced parentheses, missing operands, invalid or
/// duplicated redirections, redirections that conflict with piping -- are
/// reported here, before any subprocess is spawned.
pub fn parse_command_line(source: &str, posix: bool) -> Result<CommandLine> {
    CommandLineParser::new().parse(source, posix)
}

/// The parser behind [`parse_command_line`].
#[derive(Debug, Default)]
pub struct CommandLineParser;

impl CommandLineParser {
    /// Creates a parser.
    pub fn new() -> CommandLineParser {
        CommandLineParser
    }

    /// Parses `source` into a [`CommandLine`] tree.
    pub fn parse(&self, source: &str, posix: bool) -> Result<CommandLine> {
        let mut parser = Parser {
            lexer: ShellLexer::new(source, posix, true),
            peeked: None,
        };
        let line = parser.parse_pipeline()?;
        if let Some(tok) = parser.peek()? {
            return Err(Error::Parse(format!("unexpected token {:?}", tok.text)));
        }
        debug!("parsed {:?} as {:?}", source, line);
        Ok(line)
    }

    /// Decomposes a run of control characters into valid operators; see
    /// [`get_valid_controls`].
    pub fn get_valid_controls(&self, run: &str) -> Vec<&'static str> {
        get_valid_controls(run)
    }
}

struct Parser<'a> {
    lexer: ShellLexer<'a>,
    peeked: Option<Option<Token>>,
}

impl Parser<'_> {
    fn peek(&mut self) -> Result<Option<&Token>> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lexer.get_token()?);
        }
        Ok(self.peeked.as_ref().unwrap().as_ref())
    }

    fn advance(&mut self) -> Result<Option<Token>> {
        match self.peeked.take() {
            Some(tok) => Ok(tok),
            None => self.lexer.get_token(),
        }
    }

    fn peek_control(&mut self) -> Result<Option<&str>> {
        Ok(match self.peek()? {
            Some(tok) if tok.kind == TokenKind::Control => Some(tok.text.as_str()),
            _ => None,
        })
    }

    // Whether the current position ends a (sub)pipeline: end of input or a
    // closing parenthesis.
    fn at_end(&mut self) -> Result<bool> {
        Ok(match self.peek()? {
            None => true,
            Some(tok) => tok.kind == TokenKind::Control && tok.text == ")",
        })
    }

    // pipeline := logical ((';' | '&') logical)* [';' | '&']
    //
    // A terminator binds to the part before it: in `a; b & c`, only `b`
    // runs in the background.  The parts are therefore folded from the
    // right, giving Seq(a, BgSeq(b, c)).
    fn parse_pipeline(&mut self) -> Result<CommandLine> {
        let mut parts: Vec<(CommandLine, bool)> = Vec::new();
        loop {
            let part = self.parse_logical()?;
            let background = match self.peek_control()? {
                Some(";") => false,
                Some("&") => true,
                _ => {
                    parts.push((part, false));
                    break;
                }
            };
            self.advance()?;
            parts.push((part, background));
            if self.at_end()? {
                break;
            }
        }
        let mut iter = parts.into_iter().rev();
        let (last, last_background) = iter.next().expect("at least one part");
        let mut result = if last_background {
            CommandLine::Background(Box::new(last))
        } else {
            last
        };
        for (part, background) in iter {
            let op = if background {
                Connector::BgSeq
            } else {
                Connector::Seq
            };
            result = connect(op, part, result);
        }
        Ok(result)
    }

    // logical := piped (('&&' | '||') piped)*
    fn parse_logical(&mut self) -> Result<CommandLine> {
        let mut left = self.parse_piped()?;
        loop {
            let op = match self.peek_control()? {
                Some("&&") => Connector::And,
                Some("||") => Connector::Or,
                _ => return Ok(left),
            };
            self.advance()?;
            let right = self.parse_piped()?;
            left = connect(op, left, right);
        }
    }

    // piped := stage (('|' | '|&') stage)*
    fn parse_piped(&mut self) -> Result<CommandLine> {
        let mut left = self.parse_stage()?;
        loop {
            let op = match self.peek_control()? {
                Some("|") => Connector::Pipe,
                Some("|&") => Connector::PipeBoth,
                _ => return Ok(left),
            };
            self.advance()?;
            let right = self.parse_stage()?;
            // A stream that goes into the pipe cannot also be redirected
            // to a file.  (Duplication targets like `>&2` are legal; the
            // pipe connection takes precedence over them.)
            if has_file_redirect(left.pipe_stage_redirects(), 1) {
                return Err(Error::Parse(
                    "cannot both redirect stdout and pipe it".into(),
                ));
            }
            if op == Connector::PipeBoth && has_file_redirect(left.pipe_stage_redirects(), 2) {
                return Err(Error::Parse(
                    "cannot both redirect stderr and pipe it with |&".into(),
                ));
            }
            if has_file_redirect(right.pipe_stage_redirects(), 0) {
                return Err(Error::Parse(
                    "cannot both redirect stdin and pipe to it".into(),
                ));
            }
            left = connect(op, left, right);
        }
    }

    // stage := '(' pipeline ')' redirects? | word+ redirects?
    fn parse_stage(&mut self) -> Result<CommandLine> {
        if self.peek_control()? == Some("(") {
            self.advance()?;
            let body = self.parse_pipeline()?;
            match self.advance()? {
                Some(tok) if tok.kind == TokenKind::Control && tok.text == ")" => {}
                _ => return Err(Error::Parse("unbalanced parenthesis".into())),
            }
            let redirects = self.parse_group_redirects()?;
            return Ok(CommandLine::Group(Box::new(body), redirects));
        }
        self.parse_simple()
    }

    fn parse_simple(&mut self) -> Result<CommandLine> {
        let mut node = Node::default();
        loop {
            match self.peek()? {
                Some(tok) if tok.kind != TokenKind::Control => {
                    let tok = self.advance()?.unwrap();
                    node.command.push(tok.text);
                }
                Some(tok) if is_redirect_op(&tok.text) => {
                    let redirect = self.parse_redirect(&mut node.command)?;
                    push_redirect(&mut node.redirects, redirect)?;
                }
                _ => break,
            }
        }
        if node.command.is_empty() && node.redirects.is_empty() {
            return Err(match self.peek()? {
                Some(tok) => Error::Parse(format!("expected command, found {:?}", tok.text)),
                None => Error::Parse("expected command".into()),
            });
        }
        if node.command.is_empty() {
            return Err(Error::Parse("redirection without a command".into()));
        }
        Ok(CommandLine::Cmd(node))
    }

    // Redirections after a closing parenthesis, where an fd prefix arrives
    // as a separate word token (e.g. `(a; b) 2> log`).
    fn parse_group_redirects(&mut self) -> Result<Vec<Redirect>> {
        let mut redirects = Vec::new();
        loop {
            match self.peek()? {
                Some(tok) if tok.kind == TokenKind::Control && is_redirect_op(&tok.text) => {
                    let mut no_words = Vec::new();
                    let redirect = self.parse_redirect(&mut no_words)?;
                    push_redirect(&mut redirects, redirect)?;
                }
                Some(tok)
                    if tok.kind != TokenKind::Control
                        && tok.text.bytes().all(|b| b.is_ascii_digit()) =>
                {
                    // Possibly an fd prefix like the `2` of `(a) 2> log`.
                    let digits = self.advance()?.unwrap();
                    match self.peek()? {
                        Some(next)
                            if next.kind == TokenKind::Control
                                && is_redirect_op(&next.text)
                                && !next.space_before =>
                        {
                            let mut fd_word = vec![digits.text];
                            let redirect = self.parse_redirect(&mut fd_word)?;
                            push_redirect(&mut redirects, redirect)?;
                        }
                        _ => {
                            return Err(Error::Parse(format!(
                                "unexpected token {:?} after group",
                                digits.text
                            )));
                        }
                    }
                }
                _ => return Ok(redirects),
            }
        }
    }

    // Parses one redirection starting at the operator token.  `words` is
    // the argument list accumulated so far; an all-digit final word directly
    // adjacent to the operator is consumed as the fd being redirected.
    fn parse_redirect(&mut self, words: &mut Vec<String>) -> Result<Redirect> {
        let op_tok = self.advance()?.unwrap();
        let op = match op_tok.text.as_str() {
            "<" => RedirectOp::Read,
            ">" => RedirectOp::Write,
            ">>" => RedirectOp::Append,
            _ => unreachable!(),
        };
        let mut fd = match op {
            RedirectOp::Read => 0,
            _ => 1,
        };
        if !op_tok.space_before
            && let Some(last) = words.last()
            && !last.is_empty()
            && last.bytes().all(|b| b.is_ascii_digit())
        {
            fd = last
                .parse()
                .map_err(|_| Error::Parse(format!("bad file descriptor {:?}", last)))?;
            words.pop();
        }
        let target = self.parse_redirect_target(&op_tok.text)?;
        match op {
            RedirectOp::Read if fd != 0 => {
                return Err(Error::Parse(format!("cannot redirect fd {} with <", fd)));
            }
            RedirectOp::Write | RedirectOp::Append if fd == 0 => {
                return Err(Error::Parse("cannot redirect fd 0 with > or >>".into()));
            }
            // Only the standard fds may be redirected to a file; arbitrary
            // fds are allowed as dup targets so that swaps like
            // `3>&1 1>&2 2>&3` work.
            _ if fd > 2 && matches!(target, RedirectTarget::File(_)) => {
                return Err(Error::Parse(format!("cannot redirect fd {}", fd)));
            }
            _ => {}
        }
        Ok(Redirect { fd, op, target })
    }

    fn parse_redirect_target(&mut self, op: &str) -> Result<RedirectTarget> {
        match self.peek()? {
            Some(tok) if tok.kind == TokenKind::Control && tok.text == "&" => {
                self.advance()?;
                match self.advance()? {
                    Some(tok)
                        if tok.kind != TokenKind::Control
                            && !tok.text.is_empty()
                            && tok.text.bytes().all(|b| b.is_ascii_digit()) =>
                    {
                        let fd = tok.text.parse().map_err(|_| {
                            Error::Parse(format!("bad redirect target &{}", tok.text))
                        })?;
                        Ok(RedirectTarget::Fd(fd))
                    }
                    Some(tok) => Err(Error::Parse(format!(
                        "bad redirect target &{}",
                        tok.text
                    ))),
                    None => Err(Error::Parse(format!("missing target after {}&", op))),
                }
            }
            Some(tok) if tok.kind != TokenKind::Control => {
                let tok = self.advance()?.unwrap();
                Ok(RedirectTarget::File(tok.text))
            }
            _ => Err(Error::Parse(format!("missing target after {}", op))),
        }
    }
}

fn is_redirect_op(text: &str) -> bool {
    matches!(text, "<" | ">" | ">>")
}

fn push_redirect(redirects: &mut Vec<Redirect>, redirect: Redirect) -> Result<()> {
    if redirects.iter().any(|r| r.fd == redirect.fd) {
        return Err(Error::Parse(format!(
            "fd {} redirected more than once",
            redirect.fd
        )));
    }
    redirects.push(redirect);
    Ok(())
}

fn connect(op: Connector, left: CommandLine, right: CommandLine) -> CommandLine {
    CommandLine::Connection {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
