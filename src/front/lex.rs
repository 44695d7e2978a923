//! The lexer.

use derive_more::Display;
use regex::Regex;

/// Tokens in the program
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    /// What token class this token belongs to.
    pub kind: TokenKind,
    /// What part of the input this token carries.
    pub text: &'src str,
    /// 1-based source line the token starts on.
    pub line: usize,
}

/// Token classes.
#[derive(Clone, Copy, PartialEq, Eq, Display, Debug)]
pub enum TokenKind {
    #[display("int")]
    Int,
    #[display("void")]
    Void,
    #[display("extern")]
    Extern,
    #[display("if")]
    If,
    #[display("else")]
    Else,
    #[display("while")]
    While,
    #[display("return")]
    Return,
    #[display("id")]
    Id,
    #[display("num")]
    Num,
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
    #[display(";")]
    Semi,
    #[display("<=")]
    Le,
    #[display(">=")]
    Ge,
    #[display("==")]
    EqEq,
    #[display("!=")]
    Ne,
    #[display("<")]
    Lt,
    #[display(">")]
    Gt,
    #[display("=")]
    Assign,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Star,
    #[display("/")]
    Slash,
}

pub struct LexError {
    pub line: usize,
    pub found: char,
}

impl Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Lexer error: unexpected character {:?} at line {}",
            self.found, self.line
        )
    }
}

impl std::fmt::Debug for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    line: usize,
    whitespace: Regex,
    matchers: Vec<(Regex, TokenKind)>,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        use TokenKind::*;
        // Keywords must precede `Id`, and two-character operators must
        // precede their one-character prefixes.
        let table: &[(&str, TokenKind)] = &[
            (r"\Aint\b", Int),
            (r"\Avoid\b", Void),
            (r"\Aextern\b", Extern),
            (r"\Aif\b", If),
            (r"\Aelse\b", Else),
            (r"\Awhile\b", While),
            (r"\Areturn\b", Return),
            (r"\A[A-Za-z_][A-Za-z0-9_]*", Id),
            (r"\A[0-9]+", Num),
            (r"\A\(", LParen),
            (r"\A\)", RParen),
            (r"\A\{", LBrace),
            (r"\A\}", RBrace),
            (r"\A;", Semi),
            (r"\A<=", TokenKind::Le),
            (r"\A>=", Ge),
            (r"\A==", EqEq),
            (r"\A!=", TokenKind::Ne),
            (r"\A<", TokenKind::Lt),
            (r"\A>", Gt),
            (r"\A=", Assign),
            (r"\A\+", Plus),
            (r"\A-", Minus),
            (r"\A\*", Star),
            (r"\A/", Slash),
        ];
        Lexer {
            input,
            pos: 0,
            line: 1,
            whitespace: Regex::new(r"\A(?:[ \t\f\r\n]|(?://[^\n]*))*").unwrap(),
            matchers: table
                .iter()
                .map(|(re, kind)| (Regex::new(re).unwrap(), *kind))
                .collect(),
        }
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    fn advance(&mut self, len: usize) {
        let consumed = &self.input[self.pos..self.pos + len];
        self.line += consumed.bytes().filter(|b| *b == b'\n').count();
        self.pos += len;
    }

    // Skip comments and whitespace
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(&self.input[self.pos..]) {
            self.advance(m.end());
        }
    }

    /// Get the next token if possible.
    ///
    /// The return type distinguishes between end-of-input and lexer error.
    pub fn next(&mut self) -> Result<Option<Token<'input>>, LexError> {
        self.skip_whitespace();
        if self.end_of_input() {
            return Ok(None);
        }
        let rest = &self.input[self.pos..];
        for (re, kind) in &self.matchers {
            if let Some(m) = re.find(rest) {
                let token = Token {
                    kind: *kind,
                    text: &rest[..m.end()],
                    line: self.line,
                };
                self.advance(m.end());
                return Ok(Some(token));
            }
        }
        Err(LexError {
            line: self.line,
            found: rest.chars().next().unwrap_or('\0'),
        })
    }
}

/// Lex the whole input into a token vector.
pub fn tokenize(input: &str) -> Result<Vec<Token<'_>>, LexError> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next()? {
        tokens.push(token);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_a_function_header() {
        let tokens = tokenize("int func(int p) { // comment\n }").unwrap();
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        use TokenKind::*;
        assert_eq!(
            kinds,
            vec![Int, Id, LParen, Int, Id, RParen, LBrace, RBrace]
        );
        assert_eq!(tokens[1].text, "func");
        assert_eq!(tokens.last().unwrap().line, 2);
    }

    #[test]
    fn two_character_operators_win() {
        let kinds: Vec<TokenKind> = tokenize("<= >= == != < >")
            .unwrap()
            .iter()
            .map(|t| t.kind)
            .collect();
        use TokenKind::*;
        assert_eq!(kinds, vec![Le, Ge, EqEq, Ne, Lt, Gt]);
    }

    #[test]
    fn rejects_stray_characters() {
        let err = tokenize("int x;\n@").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.found, '@');
    }
}
