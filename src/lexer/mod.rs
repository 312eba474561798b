use std::fmt;

use logos::Logos;

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl From<std::ops::Range<usize>> for Span {
    fn from(r: std::ops::Range<usize>) -> Self {
        Span { start: r.start, end: r.end }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LexErrorKind {
    #[default]
    UnexpectedChar,
    MalformedNumber,
    UnterminatedString,
    InvalidEscape,
}

impl fmt::Display for LexErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LexErrorKind::UnexpectedChar => "unexpected character",
            LexErrorKind::MalformedNumber => "malformed number",
            LexErrorKind::UnterminatedString => "unfinished string",
            LexErrorKind::InvalidEscape => "invalid escape sequence",
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} near '{snippet}' at byte {}", span.start)]
pub struct LexError {
    pub kind: LexErrorKind,
    pub span: Span,
    pub snippet: String,
}

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(error = LexErrorKind)]
#[logos(skip r"[ \t\r\n\f\v]+")]
#[logos(skip(r"--[^\n]*", allow_greedy = true))]
pub enum Token {
    // Keywords
    #[token("and")]
    And,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("do")]
    Do,
    #[token("else")]
    Else,
    #[token("elseif")]
    Elseif,
    #[token("end")]
    End,
    #[token("false")]
    False,
    #[token("for")]
    For,
    #[token("function")]
    Function,
    #[token("goto")]
    Goto,
    #[token("if")]
    If,
    #[token("in")]
    In,
    #[token("local")]
    Local,
    #[token("nil")]
    Nil,
    #[token("not")]
    Not,
    #[token("or")]
    Or,
    #[token("repeat")]
    Repeat,
    #[token("return")]
    Return,
    #[token("then")]
    Then,
    #[token("true")]
    True,
    #[token("until")]
    Until,
    #[token("while")]
    While,

    // Arithmetic and bitwise
    #[token("+")]
    Add,
    #[token("-")]
    Sub,
    #[token("*")]
    Mul,
    #[token("/")]
    Div,
    #[token("//")]
    Idiv,
    #[token("%")]
    Mod,
    #[token("^")]
    Pow,
    #[token("#")]
    Len,
    #[token("&")]
    BitAnd,
    #[token("~")]
    BitXor,
    #[token("|")]
    BitOr,
    #[token("<<")]
    ShiftL,
    #[token(">>")]
    ShiftR,
    #[token("..")]
    Concat,
    #[token("...")]
    Dots,

    // Comparison
    #[token("==")]
    Equal,
    #[token("~=")]
    NotEq,
    #[token("<=")]
    LesEq,
    #[token(">=")]
    GreEq,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,

    // Punctuation
    #[token("=")]
    Assign,
    #[token("(")]
    ParL,
    #[token(")")]
    ParR,
    #[token("{")]
    CurlyL,
    #[token("}")]
    CurlyR,
    #[token("[")]
    SqurL,
    #[token("]")]
    SqurR,
    #[token(";")]
    SemiColon,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,

    // Literals
    #[regex(r"0[xX][0-9a-fA-F]+", lex_hex)]
    Integer(i64),

    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", lex_float)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", lex_float)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", lex_float)]
    Float(f64),

    #[regex(r#""([^"\\\n]|\\[^\n]|\\\n)*""#, lex_string)]
    #[regex(r#"'([^'\\\n]|\\[^\n]|\\\n)*'"#, lex_string)]
    #[regex(r#""([^"\\\n]|\\[^\n]|\\\n)*"#, unfinished_string)]
    #[regex(r#"'([^'\\\n]|\\[^\n]|\\\n)*"#, unfinished_string)]
    String(Vec<u8>),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Name(String),

    // Produced by `Lexer` once the input is exhausted, never by logos itself.
    // The decimal rule lives here because its callback picks between
    // `Integer` and `Float`; it never yields `Eos`.
    #[regex(r"[0-9]+", lex_decimal)]
    Eos,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::And => "and",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::Do => "do",
            Token::Else => "else",
            Token::Elseif => "elseif",
            Token::End => "end",
            Token::False => "false",
            Token::For => "for",
            Token::Function => "function",
            Token::Goto => "goto",
            Token::If => "if",
            Token::In => "in",
            Token::Local => "local",
            Token::Nil => "nil",
            Token::Not => "not",
            Token::Or => "or",
            Token::Repeat => "repeat",
            Token::Return => "return",
            Token::Then => "then",
            Token::True => "true",
            Token::Until => "until",
            Token::While => "while",
            Token::Add => "+",
            Token::Sub => "-",
            Token::Mul => "*",
            Token::Div => "/",
            Token::Idiv => "//",
            Token::Mod => "%",
            Token::Pow => "^",
            Token::Len => "#",
            Token::BitAnd => "&",
            Token::BitXor => "~",
            Token::BitOr => "|",
            Token::ShiftL => "<<",
            Token::ShiftR => ">>",
            Token::Concat => "..",
            Token::Dots => "...",
            Token::Equal => "==",
            Token::NotEq => "~=",
            Token::LesEq => "<=",
            Token::GreEq => ">=",
            Token::Less => "<",
            Token::Greater => ">",
            Token::Assign => "=",
            Token::ParL => "(",
            Token::ParR => ")",
            Token::CurlyL => "{",
            Token::CurlyR => "}",
            Token::SqurL => "[",
            Token::SqurR => "]",
            Token::SemiColon => ";",
            Token::Colon => ":",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Integer(i) => return write!(f, "{i}"),
            Token::Float(n) => return write!(f, "{n:?}"),
            Token::String(s) => return write!(f, "\"{}\"", String::from_utf8_lossy(s)),
            Token::Name(n) => n,
            Token::Eos => "<eof>",
        };
        f.write_str(text)
    }
}

// A numeral directly followed by a name character or a dot (`3x`, `1..2`,
// `0x1g`) is one malformed token rather than two valid ones.
fn check_numeral_end(lex: &logos::Lexer<Token>) -> Result<(), LexErrorKind> {
    match lex.remainder().bytes().next() {
        Some(b) if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' => {
            Err(LexErrorKind::MalformedNumber)
        }
        _ => Ok(()),
    }
}

/// Decimal integers too large for an `i64` are read as floats.
fn lex_decimal(lex: &mut logos::Lexer<Token>) -> Result<Token, LexErrorKind> {
    check_numeral_end(lex)?;
    let digits = lex.slice();
    match digits.parse() {
        Ok(i) => Ok(Token::Integer(i)),
        Err(_) => digits.parse().map(Token::Float).map_err(|_| LexErrorKind::MalformedNumber),
    }
}

/// Hexadecimal integers wrap around on overflow.
fn lex_hex(lex: &mut logos::Lexer<Token>) -> Result<i64, LexErrorKind> {
    check_numeral_end(lex)?;
    let digits = &lex.slice()[2..];
    let mut n: i64 = 0;
    for d in digits.chars() {
        let v = d.to_digit(16).ok_or(LexErrorKind::MalformedNumber)?;
        n = n.wrapping_mul(16).wrapping_add(v as i64);
    }
    Ok(n)
}

fn lex_float(lex: &mut logos::Lexer<Token>) -> Result<f64, LexErrorKind> {
    check_numeral_end(lex)?;
    lex.slice().parse().map_err(|_| LexErrorKind::MalformedNumber)
}

fn lex_string(lex: &mut logos::Lexer<Token>) -> Result<Vec<u8>, LexErrorKind> {
    let s = lex.slice();
    unescape(&s[1..s.len() - 1])
}

fn unfinished_string(_lex: &mut logos::Lexer<Token>) -> Result<Vec<u8>, LexErrorKind> {
    Err(LexErrorKind::UnterminatedString)
}

fn unescape(body: &str) -> Result<Vec<u8>, LexErrorKind> {
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let Some(&esc) = bytes.get(i) else {
            return Err(LexErrorKind::InvalidEscape);
        };
        i += 1;
        match esc {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\\' => out.push(b'\\'),
            b'"' => out.push(b'"'),
            b'\'' => out.push(b'\''),
            b'\n' => {
                out.push(b'\n');
                if bytes.get(i) == Some(&b'\r') {
                    i += 1;
                }
            }
            b'\r' => {
                out.push(b'\n');
                if bytes.get(i) == Some(&b'\n') {
                    i += 1;
                }
            }
            b'z' => {
                while bytes.get(i).is_some_and(|c| c.is_ascii_whitespace()) {
                    i += 1;
                }
            }
            b'x' => {
                let hex = body.get(i..i + 2).ok_or(LexErrorKind::InvalidEscape)?;
                let v = u8::from_str_radix(hex, 16).map_err(|_| LexErrorKind::InvalidEscape)?;
                out.push(v);
                i += 2;
            }
            b'u' => {
                if bytes.get(i) != Some(&b'{') {
                    return Err(LexErrorKind::InvalidEscape);
                }
                let close = body[i..].find('}').ok_or(LexErrorKind::InvalidEscape)? + i;
                let code = u32::from_str_radix(&body[i + 1..close], 16)
                    .map_err(|_| LexErrorKind::InvalidEscape)?;
                let c = char::from_u32(code).ok_or(LexErrorKind::InvalidEscape)?;
                let mut buf = [0; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                i = close + 1;
            }
            b'0'..=b'9' => {
                let mut v = (esc - b'0') as u32;
                for _ in 0..2 {
                    match bytes.get(i) {
                        Some(d @ b'0'..=b'9') => {
                            v = v * 10 + (d - b'0') as u32;
                            i += 1;
                        }
                        _ => break,
                    }
                }
                out.push(u8::try_from(v).map_err(|_| LexErrorKind::InvalidEscape)?);
            }
            _ => return Err(LexErrorKind::InvalidEscape),
        }
    }
    Ok(out)
}

/// Token stream with one token of lookahead.
///
/// `peek` caches the token it reads so the following `next` hands it out
/// without lexing it again. After the input is exhausted every call yields
/// `Token::Eos`.
pub struct Lexer<'src> {
    inner: logos::Lexer<'src, Token>,
    ahead: Option<(Token, Span)>,
    span: Span,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Lexer {
            inner: Token::lexer(source),
            ahead: None,
            span: Span::UNKNOWN,
        }
    }

    pub fn next(&mut self) -> Result<Token, LexError> {
        let (tok, span) = match self.ahead.take() {
            Some(ahead) => ahead,
            None => self.advance()?,
        };
        self.span = span;
        Ok(tok)
    }

    pub fn peek(&mut self) -> Result<&Token, LexError> {
        Ok(&self.peek_spanned()?.0)
    }

    /// Span of the token `peek` would return.
    pub fn peek_span(&mut self) -> Result<Span, LexError> {
        Ok(self.peek_spanned()?.1)
    }

    /// Span of the most recently consumed token.
    pub fn span(&self) -> Span {
        self.span
    }

    fn peek_spanned(&mut self) -> Result<&(Token, Span), LexError> {
        let ahead = match self.ahead.take() {
            Some(ahead) => ahead,
            None => self.advance()?,
        };
        Ok(self.ahead.insert(ahead))
    }

    fn advance(&mut self) -> Result<(Token, Span), LexError> {
        match self.inner.next() {
            None => {
                let end = self.inner.source().len();
                Ok((Token::Eos, Span { start: end, end }))
            }
            Some(Ok(tok)) => Ok((tok, self.inner.span().into())),
            Some(Err(kind)) => Err(LexError {
                kind,
                span: self.inner.span().into(),
                snippet: self.inner.slice().to_string(),
            }),
        }
    }
}
