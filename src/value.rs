//! The tagged value layer: model-checker values interned through a pool of
//! dictionaries.
//!
//! A [`Value`] is either a scalar (boolean, 61-bit integer, program counter)
//! or a handle into one of five intern tables (atoms, dicts, sets,
//! addresses, execution contexts) held by a [`ValuePool`]. Byte-equal
//! payloads intern to the same handle, so value equality is one word
//! compare no matter how deeply aggregates nest.
//!
//! Internally every value also has a 64-bit raw word — a 3-bit tag in the
//! low bits (node addresses are 8-aligned) with a shifted scalar or node
//! address above. Aggregates are interned as the little-endian
//! concatenation of their elements' raw words, which is what makes
//! structural identity collapse to byte identity.

use crate::alloc::Worker;
use crate::dict::Dict;
use crate::node::NodeRef;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::ops::AddAssign;

/// Tag bits at the bottom of every raw word.
pub const VALUE_BITS: u32 = 3;
const VALUE_MASK: u64 = (1 << VALUE_BITS) - 1;

pub const TAG_BOOL: u64 = 0;
pub const TAG_INT: u64 = 1;
pub const TAG_ATOM: u64 = 2;
pub const TAG_PC: u64 = 3;
pub const TAG_DICT: u64 = 4;
pub const TAG_SET: u64 = 5;
pub const TAG_ADDRESS: u64 = 6;
pub const TAG_CONTEXT: u64 = 7;

/// Largest integer a value can carry; doubles as the `inf` sentinel.
pub const INT_MAX: i64 = (1 << 60) - 1;
/// Smallest integer a value can carry; doubles as the `-inf` sentinel.
pub const INT_MIN: i64 = -(1 << 60);

/// An interned aggregate payload; `None` is the empty collection, which
/// never touches a table.
pub type Agg = Option<NodeRef>;

/// One model-checker value.
///
/// Scalars carry their payload inline; aggregate variants carry the handle
/// of their interned payload. Equality is structural because interning is
/// canonical: equal payloads yield equal handles.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Atom(NodeRef),
    Pc(u64),
    /// Key-value pairs, packed key then value, pre-sorted by the producer.
    Dict(Agg),
    Set(Agg),
    Address(Agg),
    Context(NodeRef),
}

impl Value {
    /// The tag ordinal; cross-class ordering compares these.
    pub fn tag(self) -> u64 {
        match self {
            Value::Bool(_) => TAG_BOOL,
            Value::Int(_) => TAG_INT,
            Value::Atom(_) => TAG_ATOM,
            Value::Pc(_) => TAG_PC,
            Value::Dict(_) => TAG_DICT,
            Value::Set(_) => TAG_SET,
            Value::Address(_) => TAG_ADDRESS,
            Value::Context(_) => TAG_CONTEXT,
        }
    }

    /// Pack into the raw 64-bit word.
    pub(crate) fn to_raw(self) -> u64 {
        match self {
            Value::Bool(b) => ((b as u64) << VALUE_BITS) | TAG_BOOL,
            Value::Int(i) => {
                assert!(
                    (INT_MIN..=INT_MAX).contains(&i),
                    "integer exceeds the 61-bit value range"
                );
                ((i as u64) << VALUE_BITS) | TAG_INT
            }
            Value::Atom(n) => n.addr() as u64 | TAG_ATOM,
            Value::Pc(p) => {
                assert!(p <= (u64::MAX >> VALUE_BITS), "program counter exceeds the value range");
                (p << VALUE_BITS) | TAG_PC
            }
            Value::Dict(agg) => agg.map_or(0, |n| n.addr() as u64) | TAG_DICT,
            Value::Set(agg) => agg.map_or(0, |n| n.addr() as u64) | TAG_SET,
            Value::Address(agg) => agg.map_or(0, |n| n.addr() as u64) | TAG_ADDRESS,
            Value::Context(n) => n.addr() as u64 | TAG_CONTEXT,
        }
    }

    /// Unpack a raw word.
    ///
    /// # Safety
    ///
    /// Any node address in `raw` must have been packed by [`Value::to_raw`]
    /// from a handle whose table is still alive. Holds for every word the
    /// pool ever stored in an aggregate payload.
    pub(crate) unsafe fn from_raw(raw: u64) -> Value {
        let payload = raw & !VALUE_MASK;
        let agg = |p: u64| -> Agg {
            if p == 0 {
                None
            } else {
                Some(unsafe { NodeRef::from_addr(p as usize) })
            }
        };
        match raw & VALUE_MASK {
            TAG_BOOL => Value::Bool(payload != 0),
            TAG_INT => Value::Int((raw as i64) >> VALUE_BITS),
            TAG_ATOM => Value::Atom(unsafe { NodeRef::from_addr(payload as usize) }),
            TAG_PC => Value::Pc(raw >> VALUE_BITS),
            TAG_DICT => Value::Dict(agg(payload)),
            TAG_SET => Value::Set(agg(payload)),
            TAG_ADDRESS => Value::Address(agg(payload)),
            TAG_CONTEXT => Value::Context(unsafe { NodeRef::from_addr(payload as usize) }),
            _ => unreachable!(),
        }
    }
}

/// The raw 64-bit words of a packed payload.
pub(crate) fn raw_words(bytes: &[u8]) -> impl Iterator<Item = u64> + '_ {
    debug_assert_eq!(bytes.len() % 8, 0);
    bytes.chunks_exact(8).map(|w| u64::from_le_bytes(w.try_into().unwrap()))
}

/// In-memory image of an execution context before interning: the name tag
/// value, the program counter, and the stack words.
pub struct ContextRepr {
    pub nametag: Value,
    pub pc: u32,
    pub stack: Vec<Value>,
}

/// Per-table promotion counts from [`ValuePool::make_stable`]. Workers sum
/// their results and one thread hands the total to
/// [`ValuePool::set_sequential`].
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct Promoted {
    pub atoms: usize,
    pub dicts: usize,
    pub sets: usize,
    pub addresses: usize,
    pub contexts: usize,
}

impl AddAssign for Promoted {
    fn add_assign(&mut self, rhs: Promoted) {
        self.atoms += rhs.atoms;
        self.dicts += rhs.dicts;
        self.sets += rhs.sets;
        self.addresses += rhs.addresses;
        self.contexts += rhs.contexts;
    }
}

impl Promoted {
    pub fn total(self) -> usize {
        self.atoms + self.dicts + self.sets + self.addresses + self.contexts
    }
}

/// The five intern tables backing the value layer. Each embedding owns its
/// pool; there is no process-global state.
pub struct ValuePool {
    pub(crate) atoms: Dict,
    pub(crate) dicts: Dict,
    pub(crate) sets: Dict,
    pub(crate) addresses: Dict,
    pub(crate) contexts: Dict,
}

fn pack<'a>(values: impl IntoIterator<Item = &'a Value>) -> SmallVec<[u8; 128]> {
    let mut buf = SmallVec::new();
    for v in values {
        buf.extend_from_slice(&v.to_raw().to_le_bytes());
    }
    buf
}

impl ValuePool {
    /// A pool whose tables accept up to `nworkers` concurrent workers.
    pub fn new(nworkers: usize) -> Self {
        ValuePool {
            atoms: Dict::new(0, nworkers),
            dicts: Dict::new(0, nworkers),
            sets: Dict::new(0, nworkers),
            addresses: Dict::new(0, nworkers),
            contexts: Dict::new(0, nworkers),
        }
    }

    /// Intern an atom. Atom names are never empty.
    pub fn put_atom(&self, worker: Option<&Worker<'_>>, name: &[u8]) -> Value {
        assert!(!name.is_empty(), "atoms cannot be empty");
        Value::Atom(self.atoms.find(worker, name))
    }

    /// Intern a set from its elements, already in canonical order. The
    /// packed element array is the set's identity.
    pub fn put_set(&self, worker: Option<&Worker<'_>>, elems: &[Value]) -> Value {
        if elems.is_empty() {
            return Value::Set(None);
        }
        Value::Set(Some(self.sets.find(worker, &pack(elems))))
    }

    /// Intern a dict from its key-value pairs, already sorted by key by the
    /// producer.
    pub fn put_dict(&self, worker: Option<&Worker<'_>>, pairs: &[(Value, Value)]) -> Value {
        if pairs.is_empty() {
            return Value::Dict(None);
        }
        Value::Dict(Some(
            self.dicts.find(worker, &pack(pairs.iter().flat_map(|(k, v)| [k, v]))),
        ))
    }

    /// Intern an address from its selector path. The first element is the
    /// root field atom; later elements select fields or index elements.
    pub fn put_address(&self, worker: Option<&Worker<'_>>, elems: &[Value]) -> Value {
        if elems.is_empty() {
            return Value::Address(None);
        }
        Value::Address(Some(self.addresses.find(worker, &pack(elems))))
    }

    /// Intern an execution context image.
    pub fn put_context(&self, worker: Option<&Worker<'_>>, ctx: &ContextRepr) -> Value {
        let mut buf = SmallVec::<[u8; 128]>::new();
        buf.extend_from_slice(&ctx.nametag.to_raw().to_le_bytes());
        buf.extend_from_slice(&u64::from(ctx.pc).to_le_bytes());
        for v in &ctx.stack {
            buf.extend_from_slice(&v.to_raw().to_le_bytes());
        }
        Value::Context(self.contexts.find(worker, &buf))
    }

    /// The interned payload bytes behind `v`: the atom name, the packed
    /// element words of an aggregate, or a context image. `None` for the
    /// empty aggregates, which have no payload. Scalars carry no payload
    /// and asking for one is a caller bug.
    pub fn get(&self, v: Value) -> Option<&[u8]> {
        match v {
            Value::Atom(n) => Some(self.atoms.retrieve(n)),
            Value::Dict(agg) => agg.map(|n| self.dicts.retrieve(n)),
            Value::Set(agg) => agg.map(|n| self.sets.retrieve(n)),
            Value::Address(agg) => agg.map(|n| self.addresses.retrieve(n)),
            Value::Context(n) => Some(self.contexts.retrieve(n)),
            Value::Bool(_) | Value::Int(_) | Value::Pc(_) => {
                panic!("scalar values carry no payload")
            }
        }
    }

    /// An owned copy of the payload bytes; empty for empty aggregates.
    pub fn copy(&self, v: Value) -> Vec<u8> {
        self.get(v).map_or_else(Vec::new, <[u8]>::to_vec)
    }

    /// The elements of an aggregate payload.
    pub(crate) fn elements<'a>(&self, bytes: &'a [u8]) -> impl Iterator<Item = Value> + 'a {
        // Payload words were packed by to_raw from handles of this pool.
        raw_words(bytes).map(|w| unsafe { Value::from_raw(w) })
    }

    /// The name tag and program counter of an interned context.
    pub(crate) fn context_parts(&self, node: NodeRef) -> (Value, u64) {
        let bytes = self.contexts.retrieve(node);
        let mut words = raw_words(bytes);
        let nametag = words.next().expect("context payload too short");
        let pc = words.next().expect("context payload too short");
        (unsafe { Value::from_raw(nametag) }, pc)
    }

    /// Total order over values.
    ///
    /// Equal values (one word compare) are equal; across tag classes the
    /// tag ordinal decides; within a class: booleans by scalar, integers by
    /// signed scalar, atoms and contexts by lexicographic byte compare with
    /// the length as tiebreak, and the three aggregate classes recursively
    /// element by element with the length as tiebreak. The empty aggregate
    /// sorts before every non-empty one of its class. Program counters are
    /// never ordered; comparing two distinct ones is a caller bug.
    pub fn compare(&self, v1: Value, v2: Value) -> Ordering {
        if v1 == v2 {
            return Ordering::Equal;
        }
        let (t1, t2) = (v1.tag(), v2.tag());
        if t1 != t2 {
            return t1.cmp(&t2);
        }
        match (v1, v2) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(&b),
            (Value::Int(a), Value::Int(b)) => a.cmp(&b),
            (Value::Atom(a), Value::Atom(b)) => {
                self.atoms.retrieve(a).cmp(self.atoms.retrieve(b))
            }
            (Value::Pc(_), Value::Pc(_)) => panic!("program counters have no ordering"),
            (Value::Dict(a), Value::Dict(b)) => self.compare_agg(&self.dicts, a, b),
            (Value::Set(a), Value::Set(b)) => self.compare_agg(&self.sets, a, b),
            (Value::Address(a), Value::Address(b)) => self.compare_agg(&self.addresses, a, b),
            (Value::Context(a), Value::Context(b)) => {
                self.contexts.retrieve(a).cmp(self.contexts.retrieve(b))
            }
            _ => unreachable!(),
        }
    }

    fn compare_agg(&self, table: &Dict, a: Agg, b: Agg) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(na), Some(nb)) => {
                let pa = table.retrieve(na);
                let pb = table.retrieve(nb);
                for (x, y) in self.elements(pa).zip(self.elements(pb)) {
                    match self.compare(x, y) {
                        Ordering::Equal => {}
                        other => return other,
                    }
                }
                (pa.len() / 8).cmp(&(pb.len() / 8))
            }
        }
    }

    /// Switch all five tables to the concurrent regime.
    pub fn set_concurrent(&self) {
        self.atoms.set_concurrent();
        self.dicts.set_concurrent();
        self.sets.set_concurrent();
        self.addresses.set_concurrent();
        self.contexts.set_concurrent();
    }

    /// Promote the calling worker's buckets in all five tables. Runs at a
    /// quiesced barrier, one call per worker.
    pub fn make_stable(&self, worker: usize) -> Promoted {
        Promoted {
            atoms: self.atoms.make_stable(worker),
            dicts: self.dicts.make_stable(worker),
            sets: self.sets.make_stable(worker),
            addresses: self.addresses.make_stable(worker),
            contexts: self.contexts.make_stable(worker),
        }
    }

    /// Switch all five tables back to the sequential regime. `totals` is
    /// the sum of every worker's [`ValuePool::make_stable`] result.
    pub fn set_sequential(&self, totals: Promoted) {
        self.atoms.set_sequential(totals.atoms);
        self.dicts.set_sequential(totals.dicts);
        self.sets.set_sequential(totals.sets);
        self.addresses.set_sequential(totals.addresses);
        self.contexts.set_sequential(totals.contexts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_pack_and_unpack() {
        for v in [
            Value::Bool(false),
            Value::Bool(true),
            Value::Int(0),
            Value::Int(-1),
            Value::Int(12345),
            Value::Int(INT_MAX),
            Value::Int(INT_MIN),
            Value::Pc(0),
            Value::Pc(9999),
        ] {
            assert_eq!(unsafe { Value::from_raw(v.to_raw()) }, v);
        }
    }

    #[test]
    fn empty_aggregates_are_bare_tags() {
        assert_eq!(Value::Dict(None).to_raw(), TAG_DICT);
        assert_eq!(Value::Set(None).to_raw(), TAG_SET);
        assert_eq!(Value::Address(None).to_raw(), TAG_ADDRESS);
    }

    #[test]
    fn atoms_intern_to_one_handle() {
        let pool = ValuePool::new(1);
        let a = pool.put_atom(None, b"alpha");
        let b = pool.put_atom(None, b"alpha");
        let c = pool.put_atom(None, b"beta");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.get(a).unwrap(), b"alpha");
    }

    #[test]
    fn sets_intern_structurally() {
        let pool = ValuePool::new(1);
        let one = Value::Int(1);
        let two = Value::Int(2);
        let s1 = pool.put_set(None, &[one, two]);
        let s2 = pool.put_set(None, &[one, two]);
        let s3 = pool.put_set(None, &[one]);
        assert_eq!(s1, s2);
        assert_ne!(s1, s3);
        assert_eq!(pool.compare(s1, s3), Ordering::Greater);
        assert_eq!(pool.compare(s3, s1), Ordering::Less);
    }

    #[test]
    fn empty_sorts_before_non_empty() {
        let pool = ValuePool::new(1);
        let empty = pool.put_dict(None, &[]);
        assert_eq!(empty, Value::Dict(None));
        let nonempty = pool.put_dict(None, &[(Value::Int(0), Value::Int(0))]);
        assert_eq!(pool.compare(empty, nonempty), Ordering::Less);
        assert_eq!(pool.compare(nonempty, empty), Ordering::Greater);
        assert_eq!(pool.compare(empty, empty), Ordering::Equal);
    }

    #[test]
    fn cross_class_order_follows_tags() {
        let pool = ValuePool::new(1);
        let ordered = [
            Value::Bool(true),
            Value::Int(-5),
            pool.put_atom(None, b"zzz"),
            Value::Pc(7),
            pool.put_dict(None, &[(Value::Int(1), Value::Int(2))]),
            pool.put_set(None, &[Value::Int(1)]),
            pool.put_address(None, &[pool.put_atom(None, b"root")]),
        ];
        for (i, a) in ordered.iter().enumerate() {
            for b in &ordered[i + 1..] {
                assert_eq!(pool.compare(*a, *b), Ordering::Less);
                assert_eq!(pool.compare(*b, *a), Ordering::Greater);
            }
        }
    }

    #[test]
    fn nested_aggregates_compare_recursively() {
        let pool = ValuePool::new(1);
        let inner1 = pool.put_set(None, &[Value::Int(1)]);
        let inner2 = pool.put_set(None, &[Value::Int(2)]);
        let outer1 = pool.put_set(None, &[inner1]);
        let outer2 = pool.put_set(None, &[inner2]);
        assert_eq!(pool.compare(outer1, outer2), Ordering::Less);
        assert_eq!(pool.compare(outer1, pool.put_set(None, &[inner1])), Ordering::Equal);
    }

    #[test]
    fn contexts_carry_their_parts() {
        let pool = ValuePool::new(1);
        let nametag = pool.put_atom(None, b"main");
        let ctx = pool.put_context(
            None,
            &ContextRepr { nametag, pc: 12, stack: vec![Value::Int(3), Value::Bool(true)] },
        );
        let Value::Context(node) = ctx else { panic!("not a context") };
        let (tag, pc) = pool.context_parts(node);
        assert_eq!(tag, nametag);
        assert_eq!(pc, 12);
    }

    #[test]
    #[should_panic(expected = "program counters have no ordering")]
    fn pc_comparison_is_a_bug() {
        let pool = ValuePool::new(1);
        pool.compare(Value::Pc(1), Value::Pc(2));
    }

    #[test]
    #[should_panic(expected = "atoms cannot be empty")]
    fn empty_atom_is_a_bug() {
        let pool = ValuePool::new(1);
        pool.put_atom(None, b"");
    }

    #[test]
    fn copy_clones_payload() {
        let pool = ValuePool::new(1);
        let atom = pool.put_atom(None, b"payload");
        assert_eq!(pool.copy(atom), b"payload".to_vec());
        assert!(pool.copy(Value::Set(None)).is_empty());
    }
}
