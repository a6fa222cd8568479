//! Tokenizer for the script language.

use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    Let,
    If,
    Else,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    /// Statement separator: newline or `;`.
    Sep,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub line: usize,
}

fn err(line: usize, message: impl Into<String>) -> ScriptError {
    ScriptError::Parse {
        line,
        message: message.into(),
    }
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, ScriptError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start_line = line;
        let mut push = |tok: Tok| tokens.push(Token { tok, line: start_line });

        match c {
            '\n' => {
                push(Tok::Sep);
                line += 1;
                i += 1;
            }
            ';' => {
                push(Tok::Sep);
                i += 1;
            }
            ' ' | '\t' | '\r' => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(err(start_line, "unterminated string"));
                    };
                    i += 1;
                    match ch {
                        '\\' => {
                            let esc = chars
                                .get(i)
                                .copied()
                                .ok_or_else(|| err(line, "unterminated string"))?;
                            i += 1;
                            s.push(match esc {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => other,
                            });
                        }
                        '\n' => {
                            line += 1;
                            s.push('\n');
                        }
                        ch if ch == quote => break,
                        ch => s.push(ch),
                    }
                }
                tokens.push(Token {
                    tok: Tok::Str(s),
                    line: start_line,
                });
            }
            '0'..='9' => {
                let begin = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[begin..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| err(start_line, format!("invalid number {text:?}")))?;
                push(Tok::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let begin = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[begin..i].iter().collect();
                push(match word.as_str() {
                    "let" => Tok::Let,
                    "if" => Tok::If,
                    "else" => Tok::Else,
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    _ => Tok::Ident(word),
                });
            }
            _ => {
                let next = chars.get(i + 1).copied();
                let (tok, width) = match (c, next) {
                    ('=', Some('=')) => (Tok::EqEq, 2),
                    ('!', Some('=')) => (Tok::NotEq, 2),
                    ('<', Some('=')) => (Tok::Le, 2),
                    ('>', Some('=')) => (Tok::Ge, 2),
                    ('&', Some('&')) => (Tok::AndAnd, 2),
                    ('|', Some('|')) => (Tok::OrOr, 2),
                    ('=', _) => (Tok::Assign, 1),
                    ('!', _) => (Tok::Bang, 1),
                    ('<', _) => (Tok::Lt, 1),
                    ('>', _) => (Tok::Gt, 1),
                    ('+', _) => (Tok::Plus, 1),
                    ('-', _) => (Tok::Minus, 1),
                    ('*', _) => (Tok::Star, 1),
                    ('/', _) => (Tok::Slash, 1),
                    ('(', _) => (Tok::LParen, 1),
                    (')', _) => (Tok::RParen, 1),
                    ('{', _) => (Tok::LBrace, 1),
                    ('}', _) => (Tok::RBrace, 1),
                    ('[', _) => (Tok::LBracket, 1),
                    (']', _) => (Tok::RBracket, 1),
                    (',', _) => (Tok::Comma, 1),
                    (':', _) => (Tok::Colon, 1),
                    ('.', _) => (Tok::Dot, 1),
                    _ => return Err(err(start_line, format!("unexpected character {c:?}"))),
                };
                push(tok);
                i += width;
            }
        }
    }

    tokens.push(Token { tok: Tok::Eof, line });
    Ok(tokens)
}
