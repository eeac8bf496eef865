//! Tokenizer for the contract dialect.

use super::errors::VmError;

/// One piece of a template literal: raw text or an embedded expression's
/// source (parsed separately).
#[derive(Clone, Debug, PartialEq)]
pub enum TplPiece {
    Str(String),
    Expr(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Tok {
    Number(f64),
    Str(String),
    Template(Vec<TplPiece>),
    Ident(String),
    // Keywords.
    Let,
    Const,
    If,
    Else,
    While,
    For,
    Break,
    Continue,
    Return,
    True,
    False,
    Null,
    Undefined,
    Await,
    TypeOf,
    // Punctuation.
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Dot,
    Colon,
    Question,
    FatArrow,
    Assign,
    PlusAssign,
    MinusAssign,
    EqEq,
    EqEqEq,
    NotEq,
    NotEqEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    AndAnd,
    OrOr,
    Not,
    Eof,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
}

fn keyword(word: &str) -> Option<Tok> {
    Some(match word {
        "let" | "var" => Tok::Let,
        "const" => Tok::Const,
        "if" => Tok::If,
        "else" => Tok::Else,
        "while" => Tok::While,
        "for" => Tok::For,
        "break" => Tok::Break,
        "continue" => Tok::Continue,
        "return" => Tok::Return,
        "true" => Tok::True,
        "false" => Tok::False,
        "null" => Tok::Null,
        "undefined" => Tok::Undefined,
        "await" => Tok::Await,
        "typeof" => Tok::TypeOf,
        _ => return None,
    })
}

pub fn lex(source: &str) -> Result<Vec<Token>, VmError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    let mut line = 1u32;

    let err = |line: u32, message: String| VmError::Parse { line, message };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            ' ' | '\t' | '\r' => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                loop {
                    if i + 1 >= chars.len() {
                        return Err(err(line, "unterminated comment".into()));
                    }
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            '`' => {
                let start_line = line;
                i += 1;
                let mut pieces = Vec::new();
                let mut text = String::new();
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(err(start_line, "unterminated template literal".into()));
                    };
                    i += 1;
                    match ch {
                        '`' => break,
                        '\\' => {
                            let Some(&esc) = chars.get(i) else {
                                return Err(err(start_line, "unterminated escape".into()));
                            };
                            i += 1;
                            match esc {
                                'n' => text.push('\n'),
                                'r' => text.push('\r'),
                                't' => text.push('\t'),
                                '\\' => text.push('\\'),
                                '`' => text.push('`'),
                                '$' => text.push('$'),
                                other => {
                                    return Err(err(
                                        start_line,
                                        format!("unknown escape \\{other}"),
                                    ))
                                }
                            }
                        }
                        '$' if chars.get(i) == Some(&'{') => {
                            i += 1;
                            if !text.is_empty() {
                                pieces.push(TplPiece::Str(std::mem::take(&mut text)));
                            }
                            let mut depth = 1usize;
                            let mut source = String::new();
                            loop {
                                let Some(&inner) = chars.get(i) else {
                                    return Err(err(
                                        start_line,
                                        "unterminated ${ expression".into(),
                                    ));
                                };
                                i += 1;
                                match inner {
                                    '{' => depth += 1,
                                    '}' => {
                                        depth -= 1;
                                        if depth == 0 {
                                            break;
                                        }
                                    }
                                    '\n' => line += 1,
                                    _ => {}
                                }
                                source.push(inner);
                            }
                            pieces.push(TplPiece::Expr(source));
                        }
                        '\n' => {
                            line += 1;
                            text.push('\n');
                        }
                        other => text.push(other),
                    }
                }
                if !text.is_empty() {
                    pieces.push(TplPiece::Str(text));
                }
                tokens.push(Token { tok: Tok::Template(pieces), line: start_line });
            }
            '"' | '\'' => {
                let quote = c;
                let start_line = line;
                i += 1;
                let mut text = String::new();
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(err(start_line, "unterminated string".into()));
                    };
                    i += 1;
                    if ch == quote {
                        break;
                    }
                    if ch == '\n' {
                        return Err(err(start_line, "unterminated string".into()));
                    }
                    if ch == '\\' {
                        let Some(&esc) = chars.get(i) else {
                            return Err(err(start_line, "unterminated escape".into()));
                        };
                        i += 1;
                        match esc {
                            'n' => text.push('\n'),
                            'r' => text.push('\r'),
                            't' => text.push('\t'),
                            '0' => text.push('\0'),
                            '\\' => text.push('\\'),
                            '\'' => text.push('\''),
                            '"' => text.push('"'),
                            'u' => {
                                if i + 4 > chars.len() {
                                    return Err(err(start_line, "bad unicode escape".into()));
                                }
                                let hex: String = chars[i..i + 4].iter().collect();
                                i += 4;
                                let code = u32::from_str_radix(&hex, 16)
                                    .map_err(|_| err(start_line, "bad unicode escape".into()))?;
                                let ch = char::from_u32(code)
                                    .ok_or_else(|| err(start_line, "bad unicode escape".into()))?;
                                text.push(ch);
                            }
                            other => {
                                return Err(err(
                                    start_line,
                                    format!("unknown escape \\{other}"),
                                ))
                            }
                        }
                    } else {
                        text.push(ch);
                    }
                }
                tokens.push(Token { tok: Tok::Str(text), line: start_line });
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if chars.get(i) == Some(&'.')
                    && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())
                {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if matches!(chars.get(i), Some('e') | Some('E')) {
                    let mut j = i + 1;
                    if matches!(chars.get(j), Some('+') | Some('-')) {
                        j += 1;
                    }
                    if chars.get(j).is_some_and(|c| c.is_ascii_digit()) {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value: f64 = text
                    .parse()
                    .map_err(|_| err(line, format!("bad number {text}")))?;
                tokens.push(Token { tok: Tok::Number(value), line });
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let tok = keyword(&word).unwrap_or(Tok::Ident(word));
                tokens.push(Token { tok, line });
            }
            _ => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let three: String = chars[i..chars.len().min(i + 3)].iter().collect();
                let (tok, width) = match (three.as_str(), two.as_str(), c) {
                    ("===", _, _) => (Tok::EqEqEq, 3),
                    ("!==", _, _) => (Tok::NotEqEq, 3),
                    (_, "==", _) => (Tok::EqEq, 2),
                    (_, "!=", _) => (Tok::NotEq, 2),
                    (_, "<=", _) => (Tok::Le, 2),
                    (_, ">=", _) => (Tok::Ge, 2),
                    (_, "&&", _) => (Tok::AndAnd, 2),
                    (_, "||", _) => (Tok::OrOr, 2),
                    (_, "=>", _) => (Tok::FatArrow, 2),
                    (_, "+=", _) => (Tok::PlusAssign, 2),
                    (_, "-=", _) => (Tok::MinusAssign, 2),
                    (_, _, '(') => (Tok::LParen, 1),
                    (_, _, ')') => (Tok::RParen, 1),
                    (_, _, '[') => (Tok::LBracket, 1),
                    (_, _, ']') => (Tok::RBracket, 1),
                    (_, _, '{') => (Tok::LBrace, 1),
                    (_, _, '}') => (Tok::RBrace, 1),
                    (_, _, ',') => (Tok::Comma, 1),
                    (_, _, ';') => (Tok::Semi, 1),
                    (_, _, '.') => (Tok::Dot, 1),
                    (_, _, ':') => (Tok::Colon, 1),
                    (_, _, '?') => (Tok::Question, 1),
                    (_, _, '=') => (Tok::Assign, 1),
                    (_, _, '<') => (Tok::Lt, 1),
                    (_, _, '>') => (Tok::Gt, 1),
                    (_, _, '+') => (Tok::Plus, 1),
                    (_, _, '-') => (Tok::Minus, 1),
                    (_, _, '*') => (Tok::Star, 1),
                    (_, _, '/') => (Tok::Slash, 1),
                    (_, _, '%') => (Tok::Percent, 1),
                    (_, _, '!') => (Tok::Not, 1),
                    (_, _, other) => {
                        return Err(err(line, format!("unexpected character {other:?}")))
                    }
                };
                tokens.push(Token { tok, line });
                i += width;
            }
        }
    }
    tokens.push(Token { tok: Tok::Eof, line });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        lex(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            toks("let x = 1.5;"),
            vec![
                Tok::Let,
                Tok::Ident("x".into()),
                Tok::Assign,
                Tok::Number(1.5),
                Tok::Semi,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_multi_character_operators() {
        assert_eq!(
            toks("a === b !== c => d == e"),
            vec![
                Tok::Ident("a".into()),
                Tok::EqEqEq,
                Tok::Ident("b".into()),
                Tok::NotEqEq,
                Tok::Ident("c".into()),
                Tok::FatArrow,
                Tok::Ident("d".into()),
                Tok::EqEq,
                Tok::Ident("e".into()),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            toks(r#" "a\nb" 'c\'d' "A" "#),
            vec![
                Tok::Str("a\nb".into()),
                Tok::Str("c'd".into()),
                Tok::Str("A".into()),
                Tok::Eof
            ]
        );
        assert!(lex("\"unterminated").is_err());
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            toks("1 // line\n/* block\nstill */ 2"),
            vec![Tok::Number(1.0), Tok::Number(2.0), Tok::Eof]
        );
    }

    #[test]
    fn test_template_literals() {
        assert_eq!(
            toks(r#"`a ${x + 1} b`"#),
            vec![
                Tok::Template(vec![
                    TplPiece::Str("a ".into()),
                    TplPiece::Expr("x + 1".into()),
                    TplPiece::Str(" b".into()),
                ]),
                Tok::Eof
            ]
        );
        assert_eq!(
            toks(r#"`${a}${b}`"#),
            vec![
                Tok::Template(vec![TplPiece::Expr("a".into()), TplPiece::Expr("b".into())]),
                Tok::Eof
            ]
        );
        // Nested braces inside the expression.
        assert_eq!(
            toks(r#"`${ {a: 1}.a }`"#),
            vec![
                Tok::Template(vec![TplPiece::Expr(" {a: 1}.a ".into())]),
                Tok::Eof
            ]
        );
        assert!(lex("`unterminated").is_err());
    }

    #[test]
    fn test_line_tracking() {
        let tokens = lex("a\nb\n  c").unwrap();
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[2].line, 3);
    }
}
