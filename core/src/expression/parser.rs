use super::ast::{BinaryOp, Expr, Function, UnaryOp};
use super::error::{ExpressionError, ExpressionResult};
use super::lexer::{Lexer, Token};
use crate::row::{RowShape, Value};

/// Recursive-descent parser; column names are resolved against `shape`
/// while parsing so evaluation only indexes into the row.
pub struct Parser<'a> {
    lexer: Lexer,
    current_token: Token,
    token_start: usize,
    shape: &'a RowShape,
}

impl<'a> Parser<'a> {
    pub fn new(input: &str, shape: &'a RowShape) -> ExpressionResult<Self> {
        let mut lexer = Lexer::new(input);
        let current_token = lexer.next()?;

        Ok(Self {
            lexer,
            current_token,
            token_start: 0,
            shape,
        })
    }

    pub fn parse(mut self) -> ExpressionResult<Expr> {
        let expr = self.parse_expression()?;
        if self.current_token != Token::Eof {
            return Err(self.unexpected_token("end of expression"));
        }
        Ok(expr)
    }

    fn parse_expression(&mut self) -> ExpressionResult<Expr> {
        self.parse_or_expression()
    }

    fn parse_or_expression(&mut self) -> ExpressionResult<Expr> {
        let mut left = self.parse_and_expression()?;

        while self.current_token == Token::Or {
            self.advance()?;
            let right = self.parse_and_expression()?;
            left = Expr::binary(BinaryOp::Or, left, right);
        }

        Ok(left)
    }

    fn parse_and_expression(&mut self) -> ExpressionResult<Expr> {
        let mut left = self.parse_not_expression()?;

        while self.current_token == Token::And {
            self.advance()?;
            let right = self.parse_not_expression()?;
            left = Expr::binary(BinaryOp::And, left, right);
        }

        Ok(left)
    }

    fn parse_not_expression(&mut self) -> ExpressionResult<Expr> {
        if self.current_token == Token::Not {
            self.advance()?;
            let operand = self.parse_not_expression()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison_expression()
    }

    fn parse_comparison_expression(&mut self) -> ExpressionResult<Expr> {
        let left = self.parse_additive_expression()?;

        if self.current_token == Token::Is {
            self.advance()?;
            let negated = if self.current_token == Token::Not {
                self.advance()?;
                true
            } else {
                false
            };
            self.expect(Token::Null)?;
            return Ok(Expr::IsNull {
                operand: Box::new(left),
                negated,
            });
        }

        let op = match &self.current_token {
            Token::Equal => BinaryOp::Eq,
            Token::NotEqual => BinaryOp::NotEq,
            Token::Less => BinaryOp::Lt,
            Token::Greater => BinaryOp::Gt,
            Token::LessEqual => BinaryOp::LtEq,
            Token::GreaterEqual => BinaryOp::GtEq,
            _ => return Ok(left),
        };
        self.advance()?;

        let right = self.parse_additive_expression()?;
        Ok(Expr::binary(op, left, right))
    }

    fn parse_additive_expression(&mut self) -> ExpressionResult<Expr> {
        let mut left = self.parse_multiplicative_expression()?;

        loop {
            let op = match self.current_token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance()?;
            let right = self.parse_multiplicative_expression()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn parse_multiplicative_expression(&mut self) -> ExpressionResult<Expr> {
        let mut left = self.parse_unary_expression()?;

        loop {
            let op = match self.current_token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.advance()?;
            let right = self.parse_unary_expression()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn parse_unary_expression(&mut self) -> ExpressionResult<Expr> {
        if self.current_token == Token::Minus {
            self.advance()?;
            let operand = self.parse_unary_expression()?;
            return Ok(match operand {
                Expr::Literal(Value::Integer(n)) => Expr::Literal(Value::Integer(-n)),
                Expr::Literal(Value::Float(x)) => Expr::Literal(Value::Float(-x)),
                other => Expr::Unary {
                    op: UnaryOp::Negate,
                    operand: Box::new(other),
                },
            });
        }
        self.parse_primary_expression()
    }

    fn parse_primary_expression(&mut self) -> ExpressionResult<Expr> {
        let literal = match &self.current_token {
            Token::IntLiteral(n) => Some(Value::Integer(*n)),
            Token::FloatLiteral(x) => Some(Value::Float(*x)),
            Token::StringLiteral(s) => Some(Value::Text(s.clone())),
            Token::True => Some(Value::Boolean(true)),
            Token::False => Some(Value::Boolean(false)),
            Token::Null => Some(Value::Null),
            _ => None,
        };
        if let Some(value) = literal {
            self.advance()?;
            return Ok(Expr::Literal(value));
        }

        match &self.current_token {
            Token::Identifier(name) => {
                let name = name.clone();
                self.advance()?;
                if self.current_token == Token::LeftParen {
                    self.parse_call(&name)
                } else {
                    let index = self
                        .shape
                        .index_of(&name)
                        .ok_or(ExpressionError::UnknownColumn(name))?;
                    Ok(Expr::Column(index))
                }
            }
            Token::LeftParen => {
                self.advance()?;
                let expr = self.parse_expression()?;
                self.expect(Token::RightParen)?;
                Ok(expr)
            }
            _ => Err(self.unexpected_token("expression")),
        }
    }

    fn parse_call(&mut self, name: &str) -> ExpressionResult<Expr> {
        let function = Function::from_name(name)
            .ok_or_else(|| ExpressionError::UnknownFunction(name.to_string()))?;
        self.expect(Token::LeftParen)?;

        let mut args = Vec::new();
        if self.current_token != Token::RightParen {
            args.push(self.parse_expression()?);
            while self.current_token == Token::Comma {
                self.advance()?;
                args.push(self.parse_expression()?);
            }
        }
        self.expect(Token::RightParen)?;

        function.check_arity(args.len())?;
        Ok(Expr::Call { function, args })
    }

    fn advance(&mut self) -> ExpressionResult<()> {
        self.token_start = self.lexer.position();
        self.current_token = self.lexer.next()?;
        Ok(())
    }

    fn expect(&mut self, expected: Token) -> ExpressionResult<()> {
        if std::mem::discriminant(&self.current_token) == std::mem::discriminant(&expected) {
            self.advance()
        } else {
            Err(self.unexpected_token(&format!("{:?}", expected)))
        }
    }

    fn unexpected_token(&self, expected: &str) -> ExpressionError {
        ExpressionError::UnexpectedToken {
            expected: expected.to_string(),
            found: format!("{:?}", self.current_token),
            position: self.token_start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, DataType};

    fn shape() -> RowShape {
        RowShape::new(vec![
            Column::new("id", DataType::Integer),
            Column::new("qty", DataType::Integer),
        ])
    }

    #[test]
    fn test_precedence() {
        let shape = shape();
        let expr = Parser::new("qty + 2 * 3 > 10 OR NOT id IS NULL", &shape)
            .unwrap()
            .parse()
            .unwrap();

        let expected = Expr::binary(
            BinaryOp::Or,
            Expr::binary(
                BinaryOp::Gt,
                Expr::binary(
                    BinaryOp::Add,
                    Expr::Column(1),
                    Expr::binary(
                        BinaryOp::Mul,
                        Expr::Literal(Value::Integer(2)),
                        Expr::Literal(Value::Integer(3)),
                    ),
                ),
                Expr::Literal(Value::Integer(10)),
            ),
            Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(Expr::IsNull {
                    operand: Box::new(Expr::Column(0)),
                    negated: false,
                }),
            },
        );
        assert_eq!(expr, expected);
    }

    #[test]
    fn test_errors() {
        let shape = shape();
        let parse = |text: &str| Parser::new(text, &shape).and_then(|p| p.parse());

        assert_eq!(
            parse("price > 1"),
            Err(ExpressionError::UnknownColumn("price".into()))
        );
        assert_eq!(
            parse("nosuch(1)"),
            Err(ExpressionError::UnknownFunction("nosuch".into()))
        );
        assert!(matches!(
            parse("qty >"),
            Err(ExpressionError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            parse("(qty"),
            Err(ExpressionError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            parse("qty 1"),
            Err(ExpressionError::UnexpectedToken { .. })
        ));
    }
}
