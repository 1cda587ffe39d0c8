use crate::{error::ExprError, interface::Value};

type ParseResult<T> = Result<T, ExprError>;

/// Deepest nesting of sub-expressions (brackets, calls, unary operators and
/// chained assignments) the parser accepts.
const MAX_NESTING: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub(crate) const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExprNode {
    Literal(Value),
    List(Vec<ExprNode>),
    Ident(String),
    Field {
        target: Box<ExprNode>,
        field: String,
    },
    Index {
        target: Box<ExprNode>,
        index: Box<ExprNode>,
    },
    Call {
        callee: Box<ExprNode>,
        args: Vec<ExprNode>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<ExprNode>,
    },
    Binary {
        op: BinaryOp,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
    Assign {
        name: String,
        op: Option<BinaryOp>,
        value: Box<ExprNode>,
    },
    Sequence(Vec<ExprNode>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => format!("'{s}'"),
            Self::Ident(name) => name.clone(),
            Self::Punct(p) => (*p).to_string(),
        }
    }
}

/// Longest operators first so `==` is not read as `=` `=`.
const PUNCTUATION: [&str; 24] = [
    "==", "!=", "<=", ">=", "&&", "||", "+=", "-=", "+", "-", "*", "/", "%", "<", ">", "!", "=",
    "(", ")", "[", "]", ",", ".", ";",
];

fn tokenize(source: &str) -> ParseResult<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(start, current)) = chars.peek() {
        if current.is_whitespace() {
            chars.next();
            continue;
        }

        if current.is_ascii_digit() {
            let mut end = start;
            let mut is_float = false;
            while let Some(&(idx, c)) = chars.peek() {
                if c.is_ascii_digit() {
                    end = idx.saturating_add(1);
                    chars.next();
                } else if c == '.' && !is_float {
                    // Only a decimal point when a digit follows, so `1.size` stays a field access.
                    let next_is_digit = source
                        .get(idx.saturating_add(1)..)
                        .and_then(|rest| rest.chars().next())
                        .is_some_and(|d| d.is_ascii_digit());
                    if !next_is_digit {
                        break;
                    }
                    is_float = true;
                    end = idx.saturating_add(1);
                    chars.next();
                } else {
                    break;
                }
            }
            let text = source.get(start..end).unwrap_or_default();
            let token = if is_float {
                text.parse::<f64>().map(Token::Float).map_err(|e| ExprError::Syntax {
                    offset: start,
                    message: e.to_string(),
                })?
            } else {
                text.parse::<i64>().map(Token::Int).map_err(|e| ExprError::Syntax {
                    offset: start,
                    message: e.to_string(),
                })?
            };
            tokens.push((start, token));
            continue;
        }

        if current.is_alphabetic() || current == '_' {
            let mut name = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push((start, Token::Ident(name)));
            continue;
        }

        if current == '"' || current == '\'' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            while let Some((_, c)) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some((_, 'n')) => text.push('\n'),
                        Some((_, 't')) => text.push('\t'),
                        Some((_, 'r')) => text.push('\r'),
                        Some((_, escaped)) => text.push(escaped),
                        None => break,
                    },
                    c if c == current => {
                        closed = true;
                        break;
                    }
                    c => text.push(c),
                }
            }
            if !closed {
                return Err(ExprError::Syntax {
                    offset: start,
                    message: "unterminated string literal".to_string(),
                });
            }
            tokens.push((start, Token::Str(text)));
            continue;
        }

        let rest = source.get(start..).unwrap_or_default();
        let Some(&punct) = PUNCTUATION.iter().find(|p| rest.starts_with(**p)) else {
            return Err(ExprError::Syntax {
                offset: start,
                message: format!("unexpected character '{current}'"),
            });
        };
        for _ in 0..punct.len() {
            chars.next();
        }
        tokens.push((start, Token::Punct(punct)));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end_offset: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn peek_punct(&self, punct: &str) -> bool {
        matches!(self.peek(), Some(Token::Punct(p)) if *p == punct)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.end_offset, |(offset, _)| *offset)
    }

    fn consume(&mut self, punct: &str) -> bool {
        if self.peek_punct(punct) {
            self.pos = self.pos.saturating_add(1);
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> ParseResult<()> {
        if self.consume(punct) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{punct}'")))
        }
    }

    fn unexpected(&self, expected: &str) -> ExprError {
        let found = self
            .peek()
            .map_or_else(|| "end of expression".to_string(), Token::describe);
        ExprError::Syntax {
            offset: self.offset(),
            message: format!("expected {expected}, found {found}"),
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, token)| token.clone());
        if token.is_some() {
            self.pos = self.pos.saturating_add(1);
        }
        token
    }

    /// Runs `parse` one nesting level deeper, failing past [`MAX_NESTING`].
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        if self.depth >= MAX_NESTING {
            return Err(ExprError::Syntax {
                offset: self.offset(),
                message: "expression nested too deeply".to_string(),
            });
        }
        self.depth = self.depth.saturating_add(1);
        let result = parse(self);
        self.depth = self.depth.saturating_sub(1);
        result
    }

    // Handles `;` separated statements, yielding the last value.
    fn parse_sequence(&mut self) -> ParseResult<ExprNode> {
        let mut items = Vec::new();
        loop {
            while self.consume(";") {}
            if self.peek().is_none() {
                break;
            }
            items.push(self.parse_assignment()?);
            if !self.peek_punct(";") {
                break;
            }
        }
        Ok(match items.len() {
            0 => ExprNode::Literal(Value::Null),
            1 => items.pop().unwrap_or(ExprNode::Literal(Value::Null)),
            _ => ExprNode::Sequence(items),
        })
    }

    fn parse_assignment(&mut self) -> ParseResult<ExprNode> {
        self.nested(Self::assignment)
    }

    fn assignment(&mut self) -> ParseResult<ExprNode> {
        if let Some(Token::Ident(name)) = self.peek() {
            let op = match self.tokens.get(self.pos.saturating_add(1)) {
                Some((_, Token::Punct("="))) => Some(None),
                Some((_, Token::Punct("+="))) => Some(Some(BinaryOp::Add)),
                Some((_, Token::Punct("-="))) => Some(Some(BinaryOp::Sub)),
                _ => None,
            };
            if let Some(op) = op {
                let name = name.clone();
                self.pos = self.pos.saturating_add(2);
                let value = self.parse_assignment()?;
                return Ok(ExprNode::Assign {
                    name,
                    op,
                    value: Box::new(value),
                });
            }
        }
        self.parse_or()
    }

    // Precedence: OR -> AND -> equality -> comparison -> additive -> multiplicative -> unary

    fn parse_or(&mut self) -> ParseResult<ExprNode> {
        let mut left = self.parse_and()?;
        while self.consume("||") {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<ExprNode> {
        let mut left = self.parse_equality()?;
        while self.consume("&&") {
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> ParseResult<ExprNode> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.consume("==") {
                BinaryOp::Eq
            } else if self.consume("!=") {
                BinaryOp::Ne
            } else {
                break;
            };
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> ParseResult<ExprNode> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.consume("<=") {
                BinaryOp::Le
            } else if self.consume(">=") {
                BinaryOp::Ge
            } else if self.consume("<") {
                BinaryOp::Lt
            } else if self.consume(">") {
                BinaryOp::Gt
            } else {
                break;
            };
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> ParseResult<ExprNode> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.consume("+") {
                BinaryOp::Add
            } else if self.consume("-") {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> ParseResult<ExprNode> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.consume("*") {
                BinaryOp::Mul
            } else if self.consume("/") {
                BinaryOp::Div
            } else if self.consume("%") {
                BinaryOp::Rem
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<ExprNode> {
        let op = if self.consume("!") {
            UnaryOp::Not
        } else if self.consume("-") {
            UnaryOp::Neg
        } else {
            return self.parse_postfix();
        };
        let operand = self.nested(Self::parse_unary)?;
        Ok(ExprNode::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_postfix(&mut self) -> ParseResult<ExprNode> {
        let mut node = self.parse_primary()?;
        loop {
            if self.consume(".") {
                match self.next_token() {
                    Some(Token::Ident(field)) => {
                        node = ExprNode::Field {
                            target: Box::new(node),
                            field,
                        };
                    }
                    _ => {
                        self.pos = self.pos.saturating_sub(1);
                        return Err(self.unexpected("a field name"));
                    }
                }
            } else if self.consume("[") {
                let index = self.parse_assignment()?;
                self.expect("]")?;
                node = ExprNode::Index {
                    target: Box::new(node),
                    index: Box::new(index),
                };
            } else if self.consume("(") {
                let args = self.parse_list_items(")")?;
                node = ExprNode::Call {
                    callee: Box::new(node),
                    args,
                };
            } else {
                return Ok(node);
            }
        }
    }

    fn parse_list_items(&mut self, close: &str) -> ParseResult<Vec<ExprNode>> {
        let mut items = Vec::new();
        if self.consume(close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_assignment()?);
            if self.consume(",") {
                continue;
            }
            self.expect(close)?;
            return Ok(items);
        }
    }

    fn parse_primary(&mut self) -> ParseResult<ExprNode> {
        let offset = self.offset();
        match self.next_token() {
            Some(Token::Int(i)) => Ok(ExprNode::Literal(Value::Int(i))),
            Some(Token::Float(f)) => Ok(ExprNode::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(ExprNode::Literal(Value::String(s))),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => ExprNode::Literal(Value::Bool(true)),
                "false" => ExprNode::Literal(Value::Bool(false)),
                "null" => ExprNode::Literal(Value::Null),
                _ => ExprNode::Ident(name),
            }),
            Some(Token::Punct("(")) => {
                let inner = self.parse_assignment()?;
                self.expect(")")?;
                Ok(inner)
            }
            Some(Token::Punct("[")) => Ok(ExprNode::List(self.parse_list_items("]")?)),
            Some(token) => Err(ExprError::Syntax {
                offset,
                message: format!("unexpected '{}'", token.describe()),
            }),
            None => Err(ExprError::Syntax {
                offset,
                message: "unexpected end of expression".to_string(),
            }),
        }
    }
}

fn binary(op: BinaryOp, left: ExprNode, right: ExprNode) -> ExprNode {
    ExprNode::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

pub(crate) fn parse(source: &str) -> ParseResult<ExprNode> {
    let mut parser = Parser {
        tokens: tokenize(source)?,
        pos: 0,
        end_offset: source.len(),
        depth: 0,
    };
    let node = parser.parse_sequence()?;
    if parser.peek().is_some() {
        return Err(parser.unexpected("end of expression"));
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! ident {
        ($name:expr) => {
            ExprNode::Ident($name.to_string())
        };
    }
    macro_rules! int {
        ($value:expr) => {
            ExprNode::Literal(Value::Int($value))
        };
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_empty_is_null() {
        assert_eq!(parse("   ").unwrap(), ExprNode::Literal(Value::Null));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_precedence_mul_over_add() {
        assert_eq!(
            parse("1 + 2 * 3").unwrap(),
            binary(BinaryOp::Add, int!(1), binary(BinaryOp::Mul, int!(2), int!(3)))
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_precedence_and_over_or() {
        assert_eq!(
            parse("a || b && c").unwrap(),
            binary(
                BinaryOp::Or,
                ident!("a"),
                binary(BinaryOp::And, ident!("b"), ident!("c"))
            )
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_postfix_chain() {
        assert_eq!(
            parse("user.tags[0]").unwrap(),
            ExprNode::Index {
                target: Box::new(ExprNode::Field {
                    target: Box::new(ident!("user")),
                    field: "tags".to_string(),
                }),
                index: Box::new(int!(0)),
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_int_followed_by_field_is_not_float() {
        assert_eq!(
            parse("1.size").unwrap(),
            ExprNode::Field {
                target: Box::new(int!(1)),
                field: "size".to_string(),
            }
        );
        assert_eq!(parse("1.5").unwrap(), ExprNode::Literal(Value::Float(1.5)));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_assignment_sequence() {
        assert_eq!(
            parse("a = 1; b += a;").unwrap(),
            ExprNode::Sequence(vec![
                ExprNode::Assign {
                    name: "a".to_string(),
                    op: None,
                    value: Box::new(int!(1)),
                },
                ExprNode::Assign {
                    name: "b".to_string(),
                    op: Some(BinaryOp::Add),
                    value: Box::new(ident!("a")),
                },
            ])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_string_escapes() {
        assert_eq!(
            parse(r#""a\"b" "#).unwrap(),
            ExprNode::Literal(Value::from("a\"b"))
        );
        assert_eq!(
            parse(r"'it\'s'").unwrap(),
            ExprNode::Literal(Value::from("it's"))
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unterminated_string() {
        let err = parse("'abc").unwrap_err();
        assert!(matches!(err, ExprError::Syntax { offset: 0, .. }));
    }

    #[test]
    #[ntest::timeout(1000)]
    fn test_deep_nesting_is_rejected() {
        let depth = 10_000;
        let parens = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        let lists = format!("{}1{}", "[".repeat(depth), "]".repeat(depth));
        let calls = format!("{}1{}", "f(".repeat(depth), ")".repeat(depth));
        let negations = format!("{}1", "-".repeat(depth));
        for source in [parens, lists, calls, negations] {
            let err = parse(&source).unwrap_err();
            assert!(
                matches!(err, ExprError::Syntax { ref message, .. } if message.contains("too deeply")),
                "got {err:?}"
            );
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_moderate_nesting_is_accepted() {
        let source = format!("{}1{}", "(".repeat(50), ")".repeat(50));
        assert_eq!(parse(&source).unwrap(), int!(1));
        assert_eq!(parse("!!!!true").unwrap(), ExprNode::Unary {
            op: UnaryOp::Not,
            operand: Box::new(ExprNode::Unary {
                op: UnaryOp::Not,
                operand: Box::new(ExprNode::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(ExprNode::Unary {
                        op: UnaryOp::Not,
                        operand: Box::new(ExprNode::Literal(Value::Bool(true))),
                    }),
                }),
            }),
        });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_trailing_garbage() {
        let err = parse("a b").unwrap_err();
        assert!(
            matches!(err, ExprError::Syntax { offset: 2, ref message } if message.contains("end of expression"))
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_character() {
        assert!(matches!(
            parse("a # b").unwrap_err(),
            ExprError::Syntax { offset: 2, .. }
        ));
    }
}
