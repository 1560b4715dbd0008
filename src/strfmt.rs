//! Printing values in the producer's human-readable format, and parsing
//! that format back.
//!
//! The printed forms: booleans `True`/`False`; integers in decimal with
//! `inf`/`-inf` for the range extremes; atoms `.name`; program counters
//! `PC(n)`; dicts `dict{ k: v, … }` with `()` for the empty dict; sets
//! `{ v, … }` with `{}` for the empty set; addresses `?name` followed by
//! `.field` or `[index]` selectors, `None` when empty; contexts
//! `CONTEXT(nametag, pc)`. Contexts print but do not parse.

use crate::value::{Value, ValuePool, INT_MAX, INT_MIN};
use thiserror::Error;

/// Error from [`ValuePool::from_str`].
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unexpected character {found:?} at byte {at}")]
    Unexpected { found: char, at: usize },
    #[error("integer out of range at byte {at}")]
    IntRange { at: usize },
    #[error("trailing input at byte {at}")]
    Trailing { at: usize },
    #[error("context values cannot be parsed")]
    Context,
}

impl ValuePool {
    /// Render `v` in the printed format.
    pub fn to_string(&self, v: Value) -> String {
        let mut out = String::new();
        self.write_value(&mut out, v);
        out
    }

    fn write_value(&self, out: &mut String, v: Value) {
        match v {
            Value::Bool(b) => out.push_str(if b { "True" } else { "False" }),
            Value::Int(INT_MAX) => out.push_str("inf"),
            Value::Int(INT_MIN) => out.push_str("-inf"),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Atom(n) => {
                out.push('.');
                out.push_str(&String::from_utf8_lossy(self.atoms.retrieve(n)));
            }
            Value::Pc(p) => {
                out.push_str("PC(");
                out.push_str(&p.to_string());
                out.push(')');
            }
            Value::Dict(None) => out.push_str("()"),
            Value::Dict(Some(n)) => {
                let elems: Vec<Value> = self.elements(self.dicts.retrieve(n)).collect();
                out.push_str("dict{ ");
                for (i, pair) in elems.chunks(2).enumerate() {
                    if i != 0 {
                        out.push_str(", ");
                    }
                    self.write_value(out, pair[0]);
                    out.push_str(": ");
                    self.write_value(out, pair[1]);
                }
                out.push_str(" }");
            }
            Value::Set(None) => out.push_str("{}"),
            Value::Set(Some(n)) => {
                let elems: Vec<Value> = self.elements(self.sets.retrieve(n)).collect();
                out.push_str("{ ");
                for (i, e) in elems.iter().enumerate() {
                    if i != 0 {
                        out.push_str(", ");
                    }
                    self.write_value(out, *e);
                }
                out.push_str(" }");
            }
            Value::Address(None) => out.push_str("None"),
            Value::Address(Some(n)) => {
                let elems: Vec<Value> = self.elements(self.addresses.retrieve(n)).collect();
                let Value::Atom(root) = elems[0] else {
                    panic!("address head is not an atom");
                };
                out.push('?');
                out.push_str(&String::from_utf8_lossy(self.atoms.retrieve(root)));
                for e in &elems[1..] {
                    match e {
                        Value::Atom(_) => self.write_value(out, *e),
                        _ => {
                            out.push('[');
                            self.write_value(out, *e);
                            out.push(']');
                        }
                    }
                }
            }
            Value::Context(n) => {
                let (nametag, pc) = self.context_parts(n);
                out.push_str("CONTEXT(");
                self.write_value(out, nametag);
                out.push_str(", ");
                out.push_str(&pc.to_string());
                out.push(')');
            }
        }
    }

    /// Parse a printed value back, interning through this pool. All
    /// non-context forms round-trip: `from_str(to_string(v)) == v`.
    pub fn from_str(&self, s: &str) -> Result<Value, ParseError> {
        let mut parser = Parser { pool: self, src: s.as_bytes(), pos: 0 };
        let v = parser.value()?;
        parser.skip_ws();
        if parser.pos != parser.src.len() {
            return Err(ParseError::Trailing { at: parser.pos });
        }
        Ok(v)
    }
}

struct Parser<'a> {
    pool: &'a ValuePool,
    src: &'a [u8],
    pos: usize,
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, b: u8) -> Result<(), ParseError> {
        match self.peek() {
            Some(found) if found == b => {
                self.pos += 1;
                Ok(())
            }
            Some(found) => Err(ParseError::Unexpected { found: found as char, at: self.pos }),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn ident(&mut self) -> Result<&'a [u8], ParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if is_ident(b)) {
            self.pos += 1;
        }
        if self.pos == start {
            return match self.peek() {
                Some(found) => Err(ParseError::Unexpected { found: found as char, at: self.pos }),
                None => Err(ParseError::UnexpectedEnd),
            };
        }
        Ok(&self.src[start..self.pos])
    }

    fn int(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).expect("ascii digits");
        let i: i64 = text.parse().map_err(|_| ParseError::IntRange { at: start })?;
        if !(INT_MIN..=INT_MAX).contains(&i) {
            return Err(ParseError::IntRange { at: start });
        }
        Ok(Value::Int(i))
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        self.skip_ws();
        match self.peek() {
            None => Err(ParseError::UnexpectedEnd),
            Some(b'.') => {
                self.pos += 1;
                let name = self.ident()?;
                Ok(self.pool.put_atom(None, name))
            }
            Some(b'?') => self.address(),
            Some(b'(') => {
                self.pos += 1;
                self.expect(b')')?;
                Ok(Value::Dict(None))
            }
            Some(b'{') => self.set(),
            Some(b'-') if self.src.get(self.pos + 1) == Some(&b'i') => {
                self.pos += 1;
                self.keyword(b"inf")?;
                Ok(Value::Int(INT_MIN))
            }
            Some(b) if b == b'-' || b.is_ascii_digit() => self.int(),
            Some(b) if b.is_ascii_alphabetic() => self.word(),
            Some(found) => Err(ParseError::Unexpected { found: found as char, at: self.pos }),
        }
    }

    fn keyword(&mut self, word: &[u8]) -> Result<(), ParseError> {
        let got = self.ident()?;
        if got == word {
            Ok(())
        } else {
            Err(ParseError::Unexpected {
                found: got[0] as char,
                at: self.pos - got.len(),
            })
        }
    }

    fn word(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        let word = self.ident()?;
        match word {
            b"True" => Ok(Value::Bool(true)),
            b"False" => Ok(Value::Bool(false)),
            b"None" => Ok(Value::Address(None)),
            b"inf" => Ok(Value::Int(INT_MAX)),
            b"PC" => {
                self.expect(b'(')?;
                let pc = match self.int()? {
                    Value::Int(i) if i >= 0 => i as u64,
                    _ => return Err(ParseError::IntRange { at: start }),
                };
                self.expect(b')')?;
                Ok(Value::Pc(pc))
            }
            b"dict" => self.dict(),
            b"CONTEXT" => Err(ParseError::Context),
            _ => Err(ParseError::Unexpected { found: word[0] as char, at: start }),
        }
    }

    fn dict(&mut self) -> Result<Value, ParseError> {
        self.expect(b'{')?;
        let mut pairs = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(b'}') {
                break;
            }
            let key = self.value()?;
            self.skip_ws();
            self.expect(b':')?;
            let val = self.value()?;
            pairs.push((key, val));
            self.skip_ws();
            if !self.eat(b',') {
                self.expect(b'}')?;
                break;
            }
        }
        Ok(self.pool.put_dict(None, &pairs))
    }

    fn set(&mut self) -> Result<Value, ParseError> {
        self.expect(b'{')?;
        let mut elems = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(b'}') {
                break;
            }
            elems.push(self.value()?);
            self.skip_ws();
            if !self.eat(b',') {
                self.expect(b'}')?;
                break;
            }
        }
        Ok(self.pool.put_set(None, &elems))
    }

    fn address(&mut self) -> Result<Value, ParseError> {
        self.expect(b'?')?;
        let root = self.ident()?;
        let mut elems = vec![self.pool.put_atom(None, root)];
        loop {
            match self.peek() {
                Some(b'.') => {
                    self.pos += 1;
                    let name = self.ident()?;
                    elems.push(self.pool.put_atom(None, name));
                }
                Some(b'[') => {
                    self.pos += 1;
                    elems.push(self.value()?);
                    self.skip_ws();
                    self.expect(b']')?;
                }
                _ => break,
            }
        }
        Ok(self.pool.put_address(None, &elems))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ContextRepr;

    #[test]
    fn prints_scalars() {
        let pool = ValuePool::new(1);
        assert_eq!(pool.to_string(Value::Bool(true)), "True");
        assert_eq!(pool.to_string(Value::Bool(false)), "False");
        assert_eq!(pool.to_string(Value::Int(42)), "42");
        assert_eq!(pool.to_string(Value::Int(-7)), "-7");
        assert_eq!(pool.to_string(Value::Int(INT_MAX)), "inf");
        assert_eq!(pool.to_string(Value::Int(INT_MIN)), "-inf");
        assert_eq!(pool.to_string(Value::Pc(3)), "PC(3)");
    }

    #[test]
    fn prints_aggregates() {
        let pool = ValuePool::new(1);
        let a = pool.put_atom(None, b"name");
        assert_eq!(pool.to_string(a), ".name");
        assert_eq!(pool.to_string(Value::Dict(None)), "()");
        assert_eq!(pool.to_string(Value::Set(None)), "{}");
        assert_eq!(pool.to_string(Value::Address(None)), "None");

        let s = pool.put_set(None, &[Value::Int(1), Value::Int(2)]);
        assert_eq!(pool.to_string(s), "{ 1, 2 }");

        let d = pool.put_dict(None, &[(a, Value::Int(1))]);
        assert_eq!(pool.to_string(d), "dict{ .name: 1 }");

        let addr = pool.put_address(
            None,
            &[pool.put_atom(None, b"obj"), pool.put_atom(None, b"field"), Value::Int(3)],
        );
        assert_eq!(pool.to_string(addr), "?obj.field[3]");
    }

    #[test]
    fn prints_contexts() {
        let pool = ValuePool::new(1);
        let nametag = pool.put_atom(None, b"init");
        let ctx =
            pool.put_context(None, &ContextRepr { nametag, pc: 9, stack: vec![Value::Int(1)] });
        assert_eq!(pool.to_string(ctx), "CONTEXT(.init, 9)");
    }

    #[test]
    fn round_trips() {
        let pool = ValuePool::new(1);
        let atom = pool.put_atom(None, b"key");
        let values = [
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(-12),
            Value::Int(INT_MAX),
            Value::Int(INT_MIN),
            Value::Pc(77),
            atom,
            Value::Dict(None),
            Value::Set(None),
            Value::Address(None),
            pool.put_set(None, &[Value::Int(1), Value::Int(2), atom]),
            pool.put_dict(None, &[(atom, Value::Int(1)), (Value::Int(2), Value::Bool(false))]),
            pool.put_address(None, &[atom, pool.put_atom(None, b"sub"), Value::Int(4)]),
        ];
        for v in values {
            let printed = pool.to_string(v);
            let parsed = pool.from_str(&printed).unwrap();
            assert_eq!(parsed, v, "round trip failed for {printed:?}");
        }
    }

    #[test]
    fn round_trips_nested() {
        let pool = ValuePool::new(1);
        let inner = pool.put_set(None, &[Value::Int(1), Value::Int(2)]);
        let dict = pool.put_dict(None, &[(pool.put_atom(None, b"xs"), inner)]);
        let outer = pool.put_set(None, &[dict, Value::Dict(None)]);
        let printed = pool.to_string(outer);
        assert_eq!(pool.from_str(&printed).unwrap(), outer);
    }

    #[test]
    fn rejects_malformed_input() {
        let pool = ValuePool::new(1);
        assert!(matches!(pool.from_str(""), Err(ParseError::UnexpectedEnd)));
        assert!(matches!(pool.from_str("Tru"), Err(ParseError::Unexpected { .. })));
        assert!(matches!(pool.from_str("{ 1, "), Err(ParseError::UnexpectedEnd)));
        assert!(matches!(pool.from_str("1 2"), Err(ParseError::Trailing { .. })));
        assert!(matches!(pool.from_str("99999999999999999999"), Err(ParseError::IntRange { .. })));
        assert!(matches!(pool.from_str("CONTEXT(.x, 1)"), Err(ParseError::Context)));
    }
}
