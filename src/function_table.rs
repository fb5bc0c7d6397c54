//! Indexed registry of handler functions (§4.3).
//!
//! One static table built at server construction, plus up to eight
//! dynamically-sized extension tables sized `2^(i+4)` for `i` in `1..=8`
//! (32, 64, … 4096 slots). Every resolved lookup re-checks the slot's live
//! `key` against the key embedded in the caller's function index, so a
//! stale index (one referring to a slot that has since been removed and
//! reused) is rejected rather than silently misrouted (§3 `FunctionIndex`
//! invariant).

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::server::ServerHandle;

/// A plain handler: receives the mutable payload buffer, returns the
/// callee's signed result code.
pub type PlainHandler = Arc<dyn Fn(&mut [u8]) -> i32 + Send + Sync>;

/// A create handler: additionally receives the server's handle, so
/// construction functions can retain server identity for later callbacks
/// (§3 `FunctionSlot`: "slot 0 of the static table is special").
pub type CreateHandler = Arc<dyn Fn(&ServerHandle, &mut [u8]) -> i32 + Send + Sync>;

/// The callable stored in a function slot.
#[derive(Clone)]
pub enum Handler {
    Plain(PlainHandler),
    Create(CreateHandler),
}

/// A populated function-table entry.
#[derive(Clone)]
struct Slot {
    name: String,
    handler: Handler,
    /// 11-bit anti-ABA tag; `0` for static slots (never checked against
    /// them since the static bit alone identifies the slot).
    key: u16,
}

/// One static-slot specification supplied at server construction.
pub struct StaticSlotSpec {
    pub name: String,
    pub handler: Handler,
}

const NUM_SUBTABLES: usize = 8;
const STATIC_BIT: u32 = 0x8000_0000;
const KEY_SHIFT: u32 = 20;
const KEY_MASK: u32 = 0x7FF;
const SUBTABLE_SHIFT: u32 = 12;
const SUBTABLE_MASK: u32 = 0xF;
const OFFSET_MASK: u32 = 0x0FFF;

fn subtable_len(i: usize) -> usize {
    1usize << (i + 4)
}

/// Resolution result: which kind of handler a slot holds, ready to invoke.
pub enum Resolved {
    Create(CreateHandler),
    Plain(PlainHandler),
}

/// The indexed registry itself: one static table plus eight dynamic
/// sub-tables, allocated lazily as `add` needs more room.
pub struct FunctionTable {
    static_slots: Vec<Option<Slot>>,
    dynamic: [Vec<Option<Slot>>; NUM_SUBTABLES],
    /// Monotonically decreasing (mod 2^11, skipping 0 and 1) key source.
    next_key: u16,
}

impl FunctionTable {
    /// Builds the static table from caller-provided slots. Only index 0
    /// may hold a `Create` handler; a `Create` handler anywhere else is
    /// rejected (§3: "All other static slots ... hold plain handlers").
    pub fn new(static_slots: Vec<StaticSlotSpec>) -> Result<Self> {
        for (i, spec) in static_slots.iter().enumerate() {
            if i != 0 {
                if let Handler::Create(_) = spec.handler {
                    return Err(Error::InvalidArgument(format!(
                        "static slot {i}: only slot 0 may be a create function"
                    )));
                }
            }
        }
        let static_slots = static_slots
            .into_iter()
            .map(|spec| {
                Some(Slot {
                    name: spec.name,
                    handler: spec.handler,
                    key: 0,
                })
            })
            .collect();
        Ok(FunctionTable {
            static_slots,
            dynamic: Default::default(),
            next_key: 0x7FF,
        })
    }

    fn take_key(&mut self) -> u16 {
        let key = self.next_key;
        self.next_key = if self.next_key <= 2 { 0x7FF } else { self.next_key - 1 };
        key
    }

    /// Registers a new dynamic handler, growing the sub-table chain if
    /// every existing sub-table is full. Returns the encoded function
    /// index.
    pub fn add(&mut self, name: String, handler: PlainHandler) -> Result<u32> {
        // scan existing sub-tables 1..=8 for an empty slot
        for i in 0..NUM_SUBTABLES {
            if self.dynamic[i].is_empty() {
                continue;
            }
            if let Some(offset) = self.dynamic[i].iter().position(|s| s.is_none()) {
                let key = self.take_key();
                self.dynamic[i][offset] = Some(Slot {
                    name,
                    handler,
                    key,
                });
                return Ok(encode_dynamic(key, (i + 1) as u8, offset as u16));
            }
        }
        // every populated sub-table is full; allocate the next unopened one
        for i in 0..NUM_SUBTABLES {
            if self.dynamic[i].is_empty() {
                self.dynamic[i] = vec![None; subtable_len(i)];
                let key = self.take_key();
                self.dynamic[i][0] = Some(Slot {
                    name,
                    handler,
                    key,
                });
                return Ok(encode_dynamic(key, (i + 1) as u8, 0));
            }
        }
        Err(Error::SymbolTableFull)
    }

    /// Removes a dynamic symbol by name. Fails with [`Error::SymbolStatic`]
    /// if the name resolves to a static slot.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let idx = self.resolve_name(name)?;
        if idx & STATIC_BIT != 0 {
            return Err(Error::SymbolStatic);
        }
        let subtable = ((idx >> SUBTABLE_SHIFT) & SUBTABLE_MASK) as usize - 1;
        let offset = (idx & OFFSET_MASK) as usize;
        self.dynamic[subtable][offset] = None;
        Ok(())
    }

    /// Linear scan for a slot with this exact name, static table first.
    pub fn resolve_name(&self, name: &str) -> Result<u32> {
        for (offset, slot) in self.static_slots.iter().enumerate() {
            if let Some(slot) = slot {
                if slot.name == name {
                    return Ok(STATIC_BIT | offset as u32);
                }
            }
        }
        for (i, table) in self.dynamic.iter().enumerate() {
            for (offset, slot) in table.iter().enumerate() {
                if let Some(slot) = slot {
                    if slot.name == name {
                        return Ok(encode_dynamic(slot.key, (i + 1) as u8, offset as u16));
                    }
                }
            }
        }
        Err(Error::SymbolNotFound)
    }

    /// Decodes `fxn_idx` and returns a cloned handle to the resolved
    /// handler, re-verifying the anti-ABA key on dynamic slots (P1).
    pub fn resolve_index(&self, fxn_idx: u32) -> Result<Resolved> {
        if fxn_idx & STATIC_BIT != 0 {
            let offset = (fxn_idx & 0xFFFF) as usize;
            let slot = self
                .static_slots
                .get(offset)
                .and_then(|s| s.as_ref())
                .ok_or(Error::InvalidFxn)?;
            return Ok(match &slot.handler {
                Handler::Create(h) => Resolved::Create(Arc::clone(h)),
                Handler::Plain(h) => Resolved::Plain(Arc::clone(h)),
            });
        }

        let key = ((fxn_idx >> KEY_SHIFT) & KEY_MASK) as u16;
        let subtable = ((fxn_idx >> SUBTABLE_SHIFT) & SUBTABLE_MASK) as usize;
        let offset = (fxn_idx & OFFSET_MASK) as usize;
        if !(1..=NUM_SUBTABLES).contains(&subtable) {
            return Err(Error::InvalidFxn);
        }
        let table = &self.dynamic[subtable - 1];
        let slot = table
            .get(offset)
            .and_then(|s| s.as_ref())
            .ok_or(Error::InvalidFxn)?;
        if slot.key != key {
            return Err(Error::InvalidFxn);
        }
        Ok(match &slot.handler {
            Handler::Create(h) => Resolved::Create(Arc::clone(h)),
            Handler::Plain(h) => Resolved::Plain(Arc::clone(h)),
        })
    }

    /// Number of configured static slots, used by the dispatcher to
    /// bounds-check incoming static indices before resolution (S2).
    pub fn static_len(&self) -> usize {
        self.static_slots.len()
    }
}

fn encode_dynamic(key: u16, subtable: u8, offset: u16) -> u32 {
    ((key as u32) << KEY_SHIFT) | ((subtable as u32) << SUBTABLE_SHIFT) | (offset as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(f: impl Fn(&mut [u8]) -> i32 + Send + Sync + 'static) -> PlainHandler {
        Arc::new(f)
    }

    #[test]
    fn add_then_resolve_round_trips() {
        // P1
        let mut table = FunctionTable::new(vec![]).unwrap();
        let idx = table.add("double".into(), plain(|_| 0)).unwrap();
        assert!(matches!(table.resolve_index(idx), Ok(Resolved::Plain(_))));
        assert_eq!(table.resolve_name("double").unwrap(), idx);
    }

    #[test]
    fn remove_invalidates_key_for_old_index() {
        // P1
        let mut table = FunctionTable::new(vec![]).unwrap();
        let idx = table.add("led_on".into(), plain(|_| 0)).unwrap();
        table.remove("led_on").unwrap();
        assert!(matches!(table.resolve_index(idx), Err(Error::InvalidFxn)));
    }

    #[test]
    fn remove_static_is_rejected() {
        let table_spec = vec![StaticSlotSpec {
            name: "init".into(),
            handler: Handler::Plain(plain(|_| 0)),
        }];
        let mut table = FunctionTable::new(table_spec).unwrap();
        assert!(matches!(table.remove("init"), Err(Error::SymbolStatic)));
    }

    #[test]
    fn only_static_slot_zero_may_be_create() {
        let bad = vec![
            StaticSlotSpec {
                name: "a".into(),
                handler: Handler::Plain(plain(|_| 0)),
            },
            StaticSlotSpec {
                name: "b".into(),
                handler: Handler::Create(Arc::new(|_h, _d| 0)),
            },
        ];
        assert!(matches!(
            FunctionTable::new(bad),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn static_index_out_of_range_is_invalid() {
        let table = FunctionTable::new(vec![StaticSlotSpec {
            name: "only".into(),
            handler: Handler::Plain(plain(|_| 0)),
        }])
        .unwrap();
        let bad_idx = STATIC_BIT | 1234;
        assert!(matches!(table.resolve_index(bad_idx), Err(Error::InvalidFxn)));
    }

    #[test]
    fn dynamic_table_grows_past_first_subtable() {
        let mut table = FunctionTable::new(vec![]).unwrap();
        // subtable 1 holds 32 slots; fill it and spill into subtable 2
        let mut last_idx = 0;
        for i in 0..33 {
            last_idx = table.add(format!("fn{i}"), plain(|_| 0)).unwrap();
        }
        let subtable = (last_idx >> SUBTABLE_SHIFT) & SUBTABLE_MASK;
        assert_eq!(subtable, 2);
    }

    #[test]
    fn keys_skip_zero_and_one_on_wrap() {
        let mut table = FunctionTable::new(vec![]).unwrap();
        table.next_key = 2;
        let key_used = table.take_key();
        assert_eq!(key_used, 2);
        assert_eq!(table.next_key, 0x7FF);
    }
}
