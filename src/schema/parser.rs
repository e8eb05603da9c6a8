//! Parser for the schema text format.
//!
//! ```text
//! syntax = "mamont1";
//!
//! // Greeting exchange
//! message HelloRequest {
//!   string greeting = 1;
//!   repeated string tags = 2;
//!   reserved 3, 4;
//! }
//!
//! service Greeter {
//!   rpc SayHello (HelloRequest) returns (HelloReply);
//! }
//! ```

use crate::error::{Error, Result};

use super::{FieldDescriptor, FieldType, MessageSchema, MethodDefinition, ServiceDefinition};

/// Everything declared by one schema text.
#[derive(Debug, Default)]
pub(super) struct Document {
    pub messages: Vec<MessageSchema>,
    pub services: Vec<ServiceDefinition>,
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(u64),
    Str(String),
    Symbol(char),
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self { chars: source.chars().peekable(), line: 1 }
    }

    fn tokens(mut self) -> Result<Vec<(Token, usize)>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push((token, self.line));
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        loop {
            match self.chars.peek().copied() {
                None => return Ok(None),
                Some('\n') => {
                    self.line += 1;
                    self.chars.next();
                }
                Some(c) if c.is_whitespace() => {
                    self.chars.next();
                }
                Some('/') => {
                    self.chars.next();
                    if self.chars.next() != Some('/') {
                        return Err(self.error("expected `//` comment"));
                    }
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.chars.next();
                    }
                }
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if !(c.is_ascii_alphanumeric() || c == '_' || c == '.') {
                            break;
                        }
                        ident.push(c);
                        self.chars.next();
                    }
                    return Ok(Some(Token::Ident(ident)));
                }
                Some(c) if c.is_ascii_digit() => {
                    let mut digits = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if !c.is_ascii_digit() {
                            break;
                        }
                        digits.push(c);
                        self.chars.next();
                    }
                    let value =
                        digits.parse().map_err(|_| self.error("number out of range"))?;
                    return Ok(Some(Token::Number(value)));
                }
                Some('"') => {
                    self.chars.next();
                    let mut value = String::new();
                    loop {
                        match self.chars.next() {
                            Some('"') => break,
                            Some('\n') | None => return Err(self.error("unterminated string")),
                            Some(c) => value.push(c),
                        }
                    }
                    return Ok(Some(Token::Str(value)));
                }
                Some(c @ ('{' | '}' | '(' | ')' | ';' | '=' | ',')) => {
                    self.chars.next();
                    return Ok(Some(Token::Symbol(c)));
                }
                Some(c) => return Err(self.error(&format!("unexpected character `{c}`"))),
            }
        }
    }

    fn error(&self, message: &str) -> Error {
        Error::SchemaParse { line: self.line, message: message.to_string() }
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, line)| *line)
            .unwrap_or(1)
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::SchemaParse { line: self.line(), message: message.into() }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<()> {
        match self.next() {
            Some(Token::Symbol(c)) if c == symbol => Ok(()),
            other => Err(self.error(format!("expected `{symbol}`, found {}", describe(&other)))),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(ident)) => Ok(ident),
            other => Err(self.error(format!("expected identifier, found {}", describe(&other)))),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        match self.next() {
            Some(Token::Ident(ident)) if ident == keyword => Ok(()),
            other => Err(self.error(format!("expected `{keyword}`, found {}", describe(&other)))),
        }
    }

    fn expect_field_number(&mut self) -> Result<u32> {
        match self.next() {
            Some(Token::Number(n)) => {
                u32::try_from(n).map_err(|_| self.error(format!("field number {n} out of range")))
            }
            other => Err(self.error(format!("expected field number, found {}", describe(&other)))),
        }
    }

    fn at_symbol(&self, symbol: char) -> bool {
        matches!(self.peek(), Some(Token::Symbol(c)) if *c == symbol)
    }

    fn document(&mut self) -> Result<Document> {
        let mut document = Document::default();
        while let Some(token) = self.next() {
            match token {
                Token::Ident(keyword) if keyword == "syntax" => {
                    self.expect_symbol('=')?;
                    match self.next() {
                        Some(Token::Str(_)) => {}
                        other => {
                            return Err(
                                self.error(format!("expected string, found {}", describe(&other)))
                            )
                        }
                    }
                    self.expect_symbol(';')?;
                }
                Token::Ident(keyword) if keyword == "package" => {
                    self.expect_ident()?;
                    self.expect_symbol(';')?;
                }
                Token::Ident(keyword) if keyword == "message" => {
                    document.messages.push(self.message()?);
                }
                Token::Ident(keyword) if keyword == "service" => {
                    document.services.push(self.service()?);
                }
                other => {
                    self.pos -= 1;
                    return Err(self.error(format!(
                        "expected `message` or `service`, found {}",
                        describe(&Some(other))
                    )));
                }
            }
        }
        Ok(document)
    }

    fn message(&mut self) -> Result<MessageSchema> {
        let name = self.expect_ident()?;
        let line = self.line();
        self.expect_symbol('{')?;
        let mut fields = Vec::new();
        let mut reserved = Vec::new();
        while !self.at_symbol('}') {
            let first = self.expect_ident()?;
            match first.as_str() {
                "reserved" => {
                    reserved.push(self.expect_field_number()?);
                    while self.at_symbol(',') {
                        self.next();
                        reserved.push(self.expect_field_number()?);
                    }
                    self.expect_symbol(';')?;
                }
                "repeated" => {
                    let inner = type_from_name(self.expect_ident()?);
                    fields.push(self.field_rest(FieldType::repeated(inner))?);
                }
                _ => {
                    let field_type = type_from_name(first);
                    fields.push(self.field_rest(field_type)?);
                }
            }
        }
        self.expect_symbol('}')?;
        MessageSchema::with_reserved(name, fields, reserved).map_err(|e| match e {
            Error::SchemaConflict(message) => Error::SchemaParse { line, message },
            other => other,
        })
    }

    fn field_rest(&mut self, field_type: FieldType) -> Result<FieldDescriptor> {
        let name = self.expect_ident()?;
        self.expect_symbol('=')?;
        let number = self.expect_field_number()?;
        self.expect_symbol(';')?;
        Ok(FieldDescriptor::new(number, name, field_type))
    }

    fn service(&mut self) -> Result<ServiceDefinition> {
        let name = self.expect_ident()?;
        let line = self.line();
        self.expect_symbol('{')?;
        let mut methods = Vec::new();
        while !self.at_symbol('}') {
            self.expect_keyword("rpc")?;
            let method = self.expect_ident()?;
            self.expect_symbol('(')?;
            let request = self.expect_ident()?;
            self.expect_symbol(')')?;
            self.expect_keyword("returns")?;
            self.expect_symbol('(')?;
            let response = self.expect_ident()?;
            self.expect_symbol(')')?;
            if self.at_symbol('{') {
                self.next();
                self.expect_symbol('}')?;
                if self.at_symbol(';') {
                    self.next();
                }
            } else {
                self.expect_symbol(';')?;
            }
            methods.push(MethodDefinition::new(method, request, response));
        }
        self.expect_symbol('}')?;
        ServiceDefinition::new(name, methods).map_err(|e| match e {
            Error::SchemaConflict(message) => Error::SchemaParse { line, message },
            other => other,
        })
    }
}

fn type_from_name(name: String) -> FieldType {
    FieldType::scalar(&name).unwrap_or(FieldType::Message(name))
}

fn describe(token: &Option<Token>) -> String {
    match token {
        None => "end of input".to_string(),
        Some(Token::Ident(s)) => format!("`{s}`"),
        Some(Token::Number(n)) => format!("`{n}`"),
        Some(Token::Str(s)) => format!("\"{s}\""),
        Some(Token::Symbol(c)) => format!("`{c}`"),
    }
}

pub(super) fn parse(source: &str) -> Result<Document> {
    let tokens = Lexer::new(source).tokens()?;
    Parser { tokens, pos: 0 }.document()
}
