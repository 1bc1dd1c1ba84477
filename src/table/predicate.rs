// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    bptree::KeyFilter,
    meta::{normalize, IndexDef, Meta},
    row::Row,
    sorter::RowSource,
    value::Value,
};
use std::{cmp::Ordering, sync::Arc};

/// Comparison operator of a predicate term
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `!=` / `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CmpOp {
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

/// One `column op literal` term
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    /// Normalized column name
    pub column: String,

    /// Operator
    pub op: CmpOp,

    /// Literal operand
    pub value: Value,
}

/// A parsed predicate string
///
/// Grammar: `[term [AND term]*] [USE INDEX [(]name[)]] [LIMIT n] [OFFSET n]`
/// where `term` is `column op literal`. Literals are numbers,
/// single-quoted strings (with `''` escapes), TRUE, FALSE or NULL.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Predicate {
    /// AND-joined terms
    pub conditions: Vec<Condition>,

    /// `USE INDEX` hint
    pub use_index: Option<String>,

    /// `LIMIT` clause
    pub limit: Option<u64>,

    /// `OFFSET` clause
    pub offset: u64,
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Op(CmpOp),
    LParen,
    RParen,
}

fn bad(input: &str, reason: &str) -> crate::Error {
    crate::Error::InvalidOperation(format!("bad predicate {input:?}: {reason}"))
}

fn lex(input: &str) -> crate::Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }

            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }

            '=' => {
                chars.next();
                tokens.push(Token::Op(CmpOp::Eq));
            }

            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(bad(input, "expected !="));
                }
                tokens.push(Token::Op(CmpOp::Ne));
            }

            '<' => {
                chars.next();
                match chars.peek() {
                    Some('=') => {
                        chars.next();
                        tokens.push(Token::Op(CmpOp::Le));
                    }
                    Some('>') => {
                        chars.next();
                        tokens.push(Token::Op(CmpOp::Ne));
                    }
                    _ => tokens.push(Token::Op(CmpOp::Lt)),
                }
            }

            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ge));
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                }
            }

            '\'' => {
                chars.next();
                let mut s = String::new();

                loop {
                    match chars.next() {
                        Some('\'') => {
                            // '' escapes a quote
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                s.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(c) => s.push(c),
                        None => return Err(bad(input, "unterminated string literal")),
                    }
                }

                tokens.push(Token::Str(s));
            }

            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let mut s = String::new();
                s.push(c);
                chars.next();

                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }

                tokens.push(Token::Number(s));
            }

            c if c.is_alphanumeric() || c == '_' => {
                let mut s = String::new();

                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }

                tokens.push(Token::Ident(s));
            }

            _ => return Err(bad(input, "unexpected character")),
        }
    }

    Ok(tokens)
}

impl Predicate {
    /// Parses a predicate string; an empty string matches everything.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let tokens = lex(input)?;
        let mut predicate = Self::default();
        let mut pos = 0;

        let keyword =
            |t: &Token, kw: &str| matches!(t, Token::Ident(word) if word.eq_ignore_ascii_case(kw));

        loop {
            let Some(token) = tokens.get(pos) else {
                break;
            };

            if keyword(token, "USE") {
                let index = tokens.get(pos + 1);
                if !index.is_some_and(|t| keyword(t, "INDEX")) {
                    return Err(bad(input, "expected INDEX after USE"));
                }

                pos += 2;

                // Optional parentheses around the index name
                let parenthesized = tokens.get(pos) == Some(&Token::LParen);
                if parenthesized {
                    pos += 1;
                }

                let Some(Token::Ident(name)) = tokens.get(pos) else {
                    return Err(bad(input, "expected an index name"));
                };
                predicate.use_index = Some(normalize(name));
                pos += 1;

                if parenthesized {
                    if tokens.get(pos) != Some(&Token::RParen) {
                        return Err(bad(input, "expected closing parenthesis"));
                    }
                    pos += 1;
                }

                continue;
            }

            if keyword(token, "LIMIT") || keyword(token, "OFFSET") {
                let Some(Token::Number(number)) = tokens.get(pos + 1) else {
                    return Err(bad(input, "expected a number"));
                };

                let value: u64 = number
                    .parse()
                    .map_err(|_| bad(input, "expected an unsigned number"))?;

                if keyword(token, "LIMIT") {
                    predicate.limit = Some(value);
                } else {
                    predicate.offset = value;
                }

                pos += 2;
                continue;
            }

            if keyword(token, "AND") {
                pos += 1;
                continue;
            }

            // A condition term: column op literal
            let Token::Ident(column) = token else {
                return Err(bad(input, "expected a column name"));
            };

            let Some(Token::Op(op)) = tokens.get(pos + 1) else {
                return Err(bad(input, "expected a comparison operator"));
            };

            let value = match tokens.get(pos + 2) {
                Some(Token::Number(number)) => {
                    if number.contains('.') {
                        Value::Decimal(
                            number
                                .parse()
                                .map_err(|_| bad(input, "bad decimal literal"))?,
                        )
                    } else {
                        Value::Int64(
                            number
                                .parse()
                                .map_err(|_| bad(input, "bad integer literal"))?,
                        )
                    }
                }
                Some(Token::Str(s)) => Value::String(s.clone()),
                Some(Token::Ident(word)) if word.eq_ignore_ascii_case("TRUE") => Value::Bit(true),
                Some(Token::Ident(word)) if word.eq_ignore_ascii_case("FALSE") => {
                    Value::Bit(false)
                }
                Some(Token::Ident(word)) if word.eq_ignore_ascii_case("NULL") => Value::Null,
                _ => return Err(bad(input, "expected a literal")),
            };

            predicate.conditions.push(Condition {
                column: normalize(column),
                op: *op,
                value,
            });

            pos += 3;
        }

        Ok(predicate)
    }
}

/// A predicate compiled against a schema and a chosen index: a descent
/// range over the index's first key column plus a residual row filter.
pub(crate) struct CompiledPredicate {
    /// (column position, operator, literal) for every term
    residual: Vec<(usize, CmpOp, Value)>,

    /// Position of the index's first key column
    key_position: usize,

    /// Lower bound on the key column (value, inclusive)
    lower: Option<(Value, bool)>,

    /// Upper bound on the key column (value, inclusive)
    upper: Option<(Value, bool)>,
}

impl CompiledPredicate {
    pub fn compile(predicate: &Predicate, meta: &Meta, index: &IndexDef) -> crate::Result<Self> {
        let mut residual = Vec::with_capacity(predicate.conditions.len());

        let first_key = index.keys.first().ok_or_else(|| {
            crate::Error::InvalidOperation(format!("index {:?} has no key columns", index.name))
        })?;

        let key_position = meta.column_position(first_key).ok_or_else(|| {
            crate::Error::InvalidOperation(format!(
                "index {:?} references unknown column {first_key:?}",
                index.name
            ))
        })?;

        let mut lower: Option<(Value, bool)> = None;
        let mut upper: Option<(Value, bool)> = None;

        for condition in &predicate.conditions {
            let position = meta.column_position(&condition.column).ok_or_else(|| {
                crate::Error::InvalidOperation(format!("unknown column {:?}", condition.column))
            })?;

            residual.push((position, condition.op, condition.value.clone()));

            // Terms on the index's first key column narrow the descent
            if position == key_position && !condition.value.is_null() {
                match condition.op {
                    CmpOp::Eq => {
                        lower = Some((condition.value.clone(), true));
                        upper = Some((condition.value.clone(), true));
                    }
                    CmpOp::Lt => upper = Some((condition.value.clone(), false)),
                    CmpOp::Le => upper = Some((condition.value.clone(), true)),
                    CmpOp::Gt => lower = Some((condition.value.clone(), false)),
                    CmpOp::Ge => lower = Some((condition.value.clone(), true)),
                    CmpOp::Ne => {}
                }
            }
        }

        Ok(Self {
            residual,
            key_position,
            lower,
            upper,
        })
    }

    /// Whether a row satisfies every term.
    ///
    /// NULL cells only match `= NULL` / fail `!= NULL`, like SQL.
    pub fn matches(&self, row: &Row) -> crate::Result<bool> {
        for (position, op, literal) in &self.residual {
            let Some(value) = row.get(*position) else {
                return Err(crate::Error::ColumnMismatch {
                    expected: *position + 1,
                    got: row.values().len(),
                });
            };

            if literal.is_null() {
                let matched = match op {
                    CmpOp::Eq => value.is_null(),
                    CmpOp::Ne => !value.is_null(),
                    _ => false,
                };

                if !matched {
                    return Ok(false);
                }

                continue;
            }

            if value.is_null() {
                return Ok(false);
            }

            if !op.accepts(value.compare(literal)?) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// The descent filter for the chosen index.
    pub fn descent_filter(&self, source: Arc<dyn RowSource>) -> RowRangeFilter {
        RowRangeFilter {
            source,
            key_position: self.key_position,
            lower: self.lower.clone(),
            upper: self.upper.clone(),
        }
    }
}

/// Steers an index cursor to rows whose first key column lies within a
/// bound range.
pub(crate) struct RowRangeFilter {
    source: Arc<dyn RowSource>,
    key_position: usize,
    lower: Option<(Value, bool)>,
    upper: Option<(Value, bool)>,
}

impl KeyFilter for RowRangeFilter {
    fn cmp(&self, key: i64) -> crate::Result<Ordering> {
        #[allow(clippy::cast_sign_loss)]
        let row = self.source.row(key as u64)?;

        let Some(value) = row.get(self.key_position) else {
            return Err(crate::Error::Internal(format!(
                "row misses key column {}",
                self.key_position
            )));
        };

        if let Some((bound, inclusive)) = &self.lower {
            match value.compare(bound)? {
                Ordering::Less => return Ok(Ordering::Greater),
                Ordering::Equal if !inclusive => return Ok(Ordering::Greater),
                _ => {}
            }
        }

        if let Some((bound, inclusive)) = &self.upper {
            match value.compare(bound)? {
                Ordering::Greater => return Ok(Ordering::Less),
                Ordering::Equal if !inclusive => return Ok(Ordering::Less),
                _ => {}
            }
        }

        Ok(Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn predicate_empty_matches_all() -> crate::Result<()> {
        let predicate = Predicate::parse("")?;
        assert!(predicate.conditions.is_empty());
        assert_eq!(None, predicate.limit);

        Ok(())
    }

    #[test]
    fn predicate_terms_and_clauses() -> crate::Result<()> {
        let predicate =
            Predicate::parse("id >= 10 AND name = 'a''b' USE INDEX by_name LIMIT 5 OFFSET 2")?;

        assert_eq!(
            vec![
                Condition {
                    column: "id".into(),
                    op: CmpOp::Ge,
                    value: Value::Int64(10),
                },
                Condition {
                    column: "name".into(),
                    op: CmpOp::Eq,
                    value: Value::String("a'b".into()),
                },
            ],
            predicate.conditions
        );

        assert_eq!(Some("by_name".into()), predicate.use_index);
        assert_eq!(Some(5), predicate.limit);
        assert_eq!(2, predicate.offset);

        Ok(())
    }

    #[test]
    fn predicate_parenthesized_index_hint() -> crate::Result<()> {
        let predicate = Predicate::parse("USE INDEX (PK)")?;
        assert_eq!(Some("pk".into()), predicate.use_index);

        Ok(())
    }

    #[test]
    fn predicate_operators() -> crate::Result<()> {
        for (text, op) in [
            ("=", CmpOp::Eq),
            ("!=", CmpOp::Ne),
            ("<>", CmpOp::Ne),
            ("<", CmpOp::Lt),
            ("<=", CmpOp::Le),
            (">", CmpOp::Gt),
            (">=", CmpOp::Ge),
        ] {
            let predicate = Predicate::parse(&format!("x {text} 1"))?;
            assert_eq!(
                Some(op),
                predicate.conditions.first().map(|c| c.op),
                "operator {text}"
            );
        }

        Ok(())
    }

    #[test]
    fn predicate_negative_and_special_literals() -> crate::Result<()> {
        let predicate = Predicate::parse("a = -5 AND b < 1.5 AND c = NULL AND d = TRUE")?;

        let values: Vec<_> = predicate.conditions.iter().map(|c| &c.value).collect();
        assert_eq!(
            vec![
                &Value::Int64(-5),
                &Value::Decimal(1.5),
                &Value::Null,
                &Value::Bit(true),
            ],
            values
        );

        Ok(())
    }

    #[test]
    fn predicate_rejects_garbage() {
        assert!(Predicate::parse("id ~ 3").is_err());
        assert!(Predicate::parse("id =").is_err());
        assert!(Predicate::parse("'unterminated").is_err());
        assert!(Predicate::parse("USE id").is_err());
        assert!(Predicate::parse("LIMIT x").is_err());
    }
}
