use crate::lex::{ShellLexer, TokenKind, get_valid_controls};

fn tokens(source: &str, posix: bool, control: bool) -> Vec<(String, TokenKind)> {
    ShellLexer::new(source, posix, control)
        .map(|tok| {
            let tok = tok.unwrap();
            (tok.text, tok.kind)
        })
        .collect()
}

fn words(source: &str, posix: bool) -> Vec<String> {
    tokens(source, posix, false)
        .into_iter()
        .map(|(text, _)| text)
        .collect()
}

const W: TokenKind = TokenKind::Word;
const Q: TokenKind = TokenKind::Quoted;
const C: TokenKind = TokenKind::Control;

fn t(text: &str, kind: TokenKind) -> (String, TokenKind) {
    (text.to_owned(), kind)
}

#[test]
fn empty() {
    for posix in [false, true] {
        assert_eq!(tokens("", posix, true), vec![]);
        assert_eq!(tokens("", posix, false), vec![]);
    }
}

#[test]
fn controls_enabled() {
    for posix in [false, true] {
        assert_eq!(tokens("a", posix, true), vec![t("a", W)]);
        assert_eq!(
            tokens("a && b\n", posix, true),
            vec![t("a", W), t("&&", C), t("b", W)]
        );
        assert_eq!(
            tokens("a | b; c>/fred/jim-sheila.txt|&d;e&", posix, true),
            vec![
                t("a", W),
                t("|", C),
                t("b", W),
                t(";", C),
                t("c", W),
                t(">", C),
                t("/fred/jim-sheila.txt", W),
                t("|&", C),
                t("d", W),
                t(";", C),
                t("e", W),
                t("&", C),
            ]
        );
    }
}

#[test]
fn controls_disabled() {
    for posix in [false, true] {
        assert_eq!(
            tokens("a && b\n", posix, false),
            vec![t("a", W), t("&", W), t("&", W), t("b", W)]
        );
        assert_eq!(
            tokens("a | b; c>/fred/jim-sheila.txt|&d;e&", posix, false),
            vec![
                t("a", W),
                t("|", W),
                t("b", W),
                t(";", W),
                t("c", W),
                t(">", W),
                t("/fred/jim-sheila.txt", W),
                t("|", W),
                t("&", W),
                t("d", W),
                t(";", W),
                t("e", W),
                t("&", W),
            ]
        );
    }
}

#[test]
fn quoting() {
    assert_eq!(tokens(r#""a b""#, false, false), vec![t(r#""a b""#, Q)]);
    assert_eq!(tokens(r#""a b""#, true, false), vec![t("a b", W)]);
    assert_eq!(
        tokens(r#""a b"  c# comment"#, false, false),
        vec![t(r#""a b""#, Q), t("c", W)]
    );
    assert_eq!(
        tokens(r#""a b"  c# comment"#, true, false),
        vec![t("a b", W), t("c", W)]
    );
}

#[test]
fn unterminated_quote() {
    for posix in [false, true] {
        let mut lexer = ShellLexer::new("\"abc", posix, false);
        assert!(lexer.get_token().is_err());
    }
}

#[test]
fn adjacent_quoted_section_joins_word() {
    assert_eq!(
        words("git rev-list --since=\"1 hours ago\"", true),
        vec!["git", "rev-list", "--since=1 hours ago"]
    );
}

#[test]
fn misc_word_chars() {
    assert_eq!(
        words("rsync user.name@host.domain.tld:path dest", false),
        vec!["rsync", "user.name@host.domain.tld:path", "dest"]
    );
    assert_eq!(
        words(r"c:\Python26\Python lister.py -d 0.01", false),
        vec![r"c:\Python26\Python", "lister.py", "-d", "0.01"]
    );
    assert_eq!(words("ls foo,bar", false), vec!["ls", "foo,bar"]);
    assert_eq!(words("ls *.py?", false), vec!["ls", "*.py?"]);
}

#[test]
fn posix_escapes() {
    assert_eq!(words(r"a\ b", true), vec!["a b"]);
    assert_eq!(words(r#""\$ \\ \"""#, true), vec![r#"\$ \ ""#]);
    assert_eq!(words(r"'\n'", true), vec![r"\n"]);
    let mut lexer = ShellLexer::new("abc\\", true, false);
    assert!(lexer.get_token().is_err());
}

#[test]
fn empty_quoted_argument() {
    assert_eq!(words("echo '' x", true), vec!["echo", "", "x"]);
}

#[test]
fn space_before_tracking() {
    let toks: Vec<_> = ShellLexer::new("a 2> b", true, true)
        .map(|t| t.unwrap())
        .collect();
    assert_eq!(toks[2].text, ">");
    assert!(!toks[2].space_before);

    let toks: Vec<_> = ShellLexer::new("a 2 > b", true, true)
        .map(|t| t.unwrap())
        .collect();
    assert_eq!(toks[2].text, ">");
    assert!(toks[2].space_before);
}

#[test]
fn token_type_side_channel() {
    let mut lexer = ShellLexer::new("a && b", true, true);
    lexer.get_token().unwrap();
    assert_eq!(lexer.token_type(), Some(TokenKind::Word));
    lexer.get_token().unwrap();
    assert_eq!(lexer.token_type(), Some(TokenKind::Control));
}

#[test]
fn valid_controls_greedy() {
    assert_eq!(get_valid_controls(">>>>"), vec![">>", ">>"]);
    assert_eq!(get_valid_controls(">>"), vec![">>"]);
    assert_eq!(get_valid_controls(">>>"), vec![">>", ">"]);
    assert_eq!(get_valid_controls(">>>>>"), vec![">>", ">>", ">"]);
    assert_eq!(get_valid_controls("))))"), vec![")", ")", ")", ")"]);
    assert_eq!(get_valid_controls(">>;>>"), vec![">>", ";", ">>"]);
    assert_eq!(get_valid_controls(";"), vec![";"]);
    assert_eq!(get_valid_controls(";;"), vec![";", ";"]);
    assert_eq!(get_valid_controls(");"), vec![")", ";"]);
    assert_eq!(get_valid_controls(">&"), vec![">", "&"]);
    assert_eq!(get_valid_controls(">>&"), vec![">>", "&"]);
    assert_eq!(get_valid_controls("||&"), vec!["||", "&"]);
    assert_eq!(get_valid_controls("|&"), vec!["|&"]);
}
