use super::error::{ExpressionError, ExpressionResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    And,
    Or,
    Not,
    Is,
    Null,
    True,
    False,

    // Literals
    IntLiteral(i64),
    FloatLiteral(f64),
    StringLiteral(String),

    // Identifiers
    Identifier(String),

    // Symbols
    LeftParen,    // (
    RightParen,   // )
    Comma,        // ,
    Plus,         // +
    Minus,        // -
    Star,         // *
    Slash,        // /
    Percent,      // %
    Equal,        // =
    NotEqual,     // != or <>
    Less,         // <
    Greater,      // >
    LessEqual,    // <=
    GreaterEqual, // >=

    Eof,
}

pub struct Lexer {
    chars: Vec<char>,
    position: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    /// Consume `second` if it follows, picking between two tokens
    fn pair(&mut self, second: char, matched: Token, single: Token) -> Token {
        self.advance();
        if self.current() == Some(second) {
            self.advance();
            matched
        } else {
            single
        }
    }

    pub fn next(&mut self) -> ExpressionResult<Token> {
        while self.current().is_some_and(char::is_whitespace) {
            self.advance();
        }

        let Some(ch) = self.current() else {
            return Ok(Token::Eof);
        };

        let single = match ch {
            '(' => Some(Token::LeftParen),
            ')' => Some(Token::RightParen),
            ',' => Some(Token::Comma),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '=' => Some(Token::Equal),
            _ => None,
        };
        if let Some(token) = single {
            self.advance();
            return Ok(token);
        }

        match ch {
            '!' => {
                self.advance();
                if self.current() == Some('=') {
                    self.advance();
                    Ok(Token::NotEqual)
                } else {
                    Err(ExpressionError::UnexpectedChar('!', self.position))
                }
            }
            '<' => {
                self.advance();
                match self.current() {
                    Some('=') => {
                        self.advance();
                        Ok(Token::LessEqual)
                    }
                    Some('>') => {
                        self.advance();
                        Ok(Token::NotEqual)
                    }
                    _ => Ok(Token::Less),
                }
            }
            '>' => Ok(self.pair('=', Token::GreaterEqual, Token::Greater)),
            '\'' => self.read_string(),
            '"' => self.read_quoted_identifier(),
            '0'..='9' => self.read_number(),
            c if c.is_alphabetic() || c == '_' => Ok(self.read_identifier()),
            _ => Err(ExpressionError::UnexpectedChar(ch, self.position)),
        }
    }

    fn read_delimited(&mut self, quote: char) -> ExpressionResult<String> {
        let start = self.position;
        self.advance(); // skip opening quote

        let mut value = String::new();
        loop {
            match self.current() {
                None => return Err(ExpressionError::UnterminatedString(start)),
                Some(c) if c == quote => {
                    self.advance();
                    // A doubled quote stands for the quote itself
                    if self.current() == Some(quote) {
                        value.push(quote);
                        self.advance();
                    } else {
                        return Ok(value);
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
    }

    fn read_string(&mut self) -> ExpressionResult<Token> {
        self.read_delimited('\'').map(Token::StringLiteral)
    }

    fn read_quoted_identifier(&mut self) -> ExpressionResult<Token> {
        self.read_delimited('"').map(Token::Identifier)
    }

    fn read_number(&mut self) -> ExpressionResult<Token> {
        let start = self.position;
        let mut is_float = false;

        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                self.advance();
            } else if ch == '.' && !is_float {
                is_float = true;
                self.advance();
            } else {
                break;
            }
        }

        let text: String = self.chars[start..self.position].iter().collect();
        if is_float {
            text.parse::<f64>()
                .map(Token::FloatLiteral)
                .map_err(|_| ExpressionError::InvalidNumber(start))
        } else {
            text.parse::<i64>()
                .map(Token::IntLiteral)
                .map_err(|_| ExpressionError::InvalidNumber(start))
        }
    }

    fn read_identifier(&mut self) -> Token {
        let start = self.position;
        while self
            .current()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.advance();
        }

        let text: String = self.chars[start..self.position].iter().collect();
        match text.to_uppercase().as_str() {
            "AND" => Token::And,
            "OR" => Token::Or,
            "NOT" => Token::Not,
            "IS" => Token::Is,
            "NULL" => Token::Null,
            "TRUE" => Token::True,
            "FALSE" => Token::False,
            _ => Token::Identifier(text),
        }
    }
}
