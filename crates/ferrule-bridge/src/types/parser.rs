//! Parser for C-style type and function declarations.
//!
//! Two entry points: [`parse_type_spec`] understands a lone type such as
//! `"unsigned int"`, `"Vec2 *"` or `"char [8]"`, and [`parse_signature`]
//! understands a whole prototype such as
//! `"int __stdcall Sum(_In_ int a, _Out_ int *b)"`.
//!
//! The grammar is deliberately small: qualifiers (`const`, `volatile`) are
//! accepted and ignored, SAL-style markers (`_In_`, `_Out_`, `_Inout_`) set
//! the parameter direction, and a trailing `...` marks a variadic
//! signature.

use std::sync::Arc;

use crate::call::CallConvention;
use crate::error::TypeDescriptionError;
use crate::types::{
    array, lookup, pointer_to, Direction, ParamDesc, TypeDesc, TypeKind, MAX_OUT_PARAMETERS,
    MAX_PARAMETERS,
};

/// A parsed function declaration, before any symbol is resolved.
pub(crate) struct ParsedSignature {
    pub(crate) name: String,
    pub(crate) convention: Option<CallConvention>,
    pub(crate) ret: Arc<TypeDesc>,
    pub(crate) params: Vec<ParamDesc>,
    pub(crate) variadic: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(usize),
    Star,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Ellipsis,
}

struct Parser<'a> {
    decl: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(decl: &'a str) -> Result<Self, TypeDescriptionError> {
        let tokens = tokenize(decl)?;
        Ok(Parser {
            decl,
            tokens,
            pos: 0,
        })
    }

    fn err(&self, detail: impl Into<String>) -> TypeDescriptionError {
        TypeDescriptionError::InvalidDeclaration {
            decl: self.decl.to_string(),
            detail: detail.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead)
    }

    fn eat(&mut self, token: Token) -> bool {
        if self.peek() == Some(&token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), TypeDescriptionError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.err(format!("expected '{what}'")))
        }
    }

    fn expect_eof(&self) -> Result<(), TypeDescriptionError> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(self.err("unexpected trailing tokens"))
        }
    }

    fn try_ident(&mut self) -> Option<String> {
        if let Some(Token::Ident(name)) = self.peek() {
            let name = name.clone();
            self.pos += 1;
            Some(name)
        } else {
            None
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, TypeDescriptionError> {
        self.try_ident().ok_or_else(|| self.err(format!("expected {what}")))
    }

    fn expect_number(&mut self) -> Result<usize, TypeDescriptionError> {
        if let Some(Token::Number(n)) = self.peek() {
            let n = *n;
            self.pos += 1;
            Ok(n)
        } else {
            Err(self.err("expected an array length"))
        }
    }

    fn try_convention(&mut self) -> Option<CallConvention> {
        let convention = match self.peek() {
            Some(Token::Ident(word)) => match word.as_str() {
                "__cdecl" => Some(CallConvention::Cdecl),
                "__stdcall" => Some(CallConvention::Stdcall),
                "__fastcall" => Some(CallConvention::Fastcall),
                "__thiscall" => Some(CallConvention::Thiscall),
                _ => None,
            },
            _ => None,
        };
        if convention.is_some() {
            self.pos += 1;
        }
        convention
    }

    /// Parse qualifiers, direction markers, a base type name and any `*`
    /// suffixes. Array brackets and parameter names are left for the caller.
    fn parse_type(&mut self) -> Result<(Arc<TypeDesc>, Direction), TypeDescriptionError> {
        let mut direction = Direction::In;

        loop {
            let modifier = match self.peek() {
                Some(Token::Ident(word)) => match word.as_str() {
                    "const" | "volatile" => Some(None),
                    "_In_" => Some(Some(Direction::In)),
                    "_Out_" => Some(Some(Direction::Out)),
                    "_Inout_" => Some(Some(Direction::InOut)),
                    _ => None,
                },
                _ => None,
            };
            match modifier {
                Some(marker) => {
                    if let Some(dir) = marker {
                        direction = dir;
                    }
                    self.pos += 1;
                }
                None => break,
            }
        }

        // Count the run of identifiers, then take the longest prefix that
        // names a known type. Whatever remains is the caller's business,
        // usually a parameter name.
        let mut run = 0;
        while matches!(self.peek_at(run), Some(Token::Ident(_))) {
            run += 1;
        }
        if run == 0 {
            return Err(self.err("expected a type name"));
        }

        let words: Vec<&str> = (0..run)
            .map(|i| match &self.tokens[self.pos + i] {
                Token::Ident(w) => w.as_str(),
                _ => unreachable!(),
            })
            .collect();

        let mut base = None;
        for n in (1..=run).rev() {
            let joined = words[..n].join(" ");
            let name = normalize_multiword(&joined).unwrap_or(&joined);
            if let Some(desc) = lookup(name) {
                base = Some((desc, n));
                break;
            }
        }
        let Some((mut desc, consumed)) = base else {
            return Err(TypeDescriptionError::UnknownType(words[0].to_string()));
        };
        self.pos += consumed;

        let mut depth = 0;
        while self.eat(Token::Star) {
            depth += 1;
            if depth > 4 {
                return Err(TypeDescriptionError::PointerDepth);
            }
            desc = pointer_to(desc);
        }

        Ok((desc, direction))
    }

    /// Parse an optional `[len]` suffix, turning `desc` into an array.
    fn try_array_suffix(
        &mut self,
        desc: Arc<TypeDesc>,
    ) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
        if !self.eat(Token::LBracket) {
            return Ok(desc);
        }
        let len = self.expect_number()?;
        self.expect(Token::RBracket, "]")?;
        array(desc, len, None)
    }
}

fn tokenize(decl: &str) -> Result<Vec<Token>, TypeDescriptionError> {
    let invalid = |ch: char| TypeDescriptionError::InvalidDeclaration {
        decl: decl.to_string(),
        detail: format!("unexpected character '{ch}'"),
    };

    let mut tokens = Vec::new();
    let mut chars = decl.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(word));
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        digits.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = digits.parse::<usize>().map_err(|_| {
                    TypeDescriptionError::InvalidDeclaration {
                        decl: decl.to_string(),
                        detail: format!("invalid number '{digits}'"),
                    }
                })?;
                tokens.push(Token::Number(n));
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '.' => {
                chars.next();
                if chars.next() != Some('.') || chars.next() != Some('.') {
                    return Err(invalid('.'));
                }
                tokens.push(Token::Ellipsis);
            }
            other => return Err(invalid(other)),
        }
    }
    Ok(tokens)
}

/// Map multiword C spellings onto registered names.
fn normalize_multiword(joined: &str) -> Option<&'static str> {
    Some(match joined {
        "unsigned char" => "uint8",
        "signed char" => "int8",
        "unsigned short" | "unsigned short int" => "uint16",
        "short int" | "signed short" | "signed short int" => "int16",
        "unsigned" | "unsigned int" => "uint32",
        "signed" | "signed int" => "int32",
        "unsigned long" | "unsigned long int" => "ulong",
        "long int" | "signed long" | "signed long int" => "long",
        "unsigned long long" | "unsigned long long int" => "uint64",
        "long long" | "long long int" | "signed long long" => "int64",
        _ => return None,
    })
}

/// Parse a lone type specification such as `"int **"` or `"char [8]"`.
pub(crate) fn parse_type_spec(
    decl: &str,
) -> Result<(Arc<TypeDesc>, Direction), TypeDescriptionError> {
    let mut parser = Parser::new(decl)?;
    let (desc, direction) = parser.parse_type()?;
    let desc = parser.try_array_suffix(desc)?;
    parser.expect_eof()?;
    Ok((desc, direction))
}

/// Parse a full function declaration.
pub(crate) fn parse_signature(decl: &str) -> Result<ParsedSignature, TypeDescriptionError> {
    let mut parser = Parser::new(decl)?;

    let mut convention = parser.try_convention();
    let (ret, ret_direction) = parser.parse_type()?;
    if ret_direction != Direction::In {
        return Err(parser.err("return types cannot have a direction"));
    }
    if let Some(conv) = parser.try_convention() {
        convention = Some(conv);
    }

    let name = parser.expect_ident("a function name")?;
    parser.expect(Token::LParen, "(")?;

    let mut params: Vec<ParamDesc> = Vec::new();
    let mut variadic = false;

    if parser.peek() == Some(&Token::Ident("void".to_string()))
        && parser.peek_at(1) == Some(&Token::RParen)
    {
        parser.pos += 2;
    } else if !parser.eat(Token::RParen) {
        loop {
            if parser.eat(Token::Ellipsis) {
                variadic = true;
                parser.expect(Token::RParen, ")")?;
                break;
            }

            let (ty, direction) = parser.parse_type()?;
            let param_name = parser.try_ident().unwrap_or_default();
            let ty = parser.try_array_suffix(ty)?;

            if direction.is_output() && !matches!(ty.kind(), TypeKind::Pointer { .. }) {
                return Err(TypeDescriptionError::DirectionOnValue(
                    ty.name().to_string(),
                ));
            }
            if direction == Direction::In {
                ty.check_parameter()?;
            }
            params.push(ParamDesc {
                name: param_name,
                ty,
                direction,
            });

            if parser.eat(Token::Comma) {
                continue;
            }
            parser.expect(Token::RParen, ")")?;
            break;
        }
    }
    parser.expect_eof()?;

    ret.check_return()?;
    if params.len() > MAX_PARAMETERS {
        return Err(TypeDescriptionError::TooManyParameters(MAX_PARAMETERS));
    }
    let out_count = params.iter().filter(|p| p.direction.is_output()).count();
    if out_count > MAX_OUT_PARAMETERS {
        return Err(TypeDescriptionError::TooManyOutParameters(
            MAX_OUT_PARAMETERS,
        ));
    }

    Ok(ParsedSignature {
        name,
        convention,
        ret,
        params,
        variadic,
    })
}
