//! Run-time realization of a generated map type
//!
//! Same layout as the rendered source of [`MapDescriptor`]: a linear-probing
//! slot table over record ids, per-record hash and key/value columns and, for
//! join maps, a `next` chain plus the tail of each chain.

use crate::codegen::hash_map::{INITIAL_SLOTS, MapDescriptor, MapKind, NEXT_FIELD, NUM_RECORDS_FIELD};
use crate::codegen::ir::BinOp;
use crate::error::{DbxError, DbxResult};
use crate::runtime::value::{ColumnData, SharedColumn, Value};
use std::sync::Arc;

const EMPTY: i32 = -1;

#[derive(Debug)]
pub struct GeneratedMap {
    descriptor: Arc<MapDescriptor>,
    slots: Vec<i32>,
    hashes: Vec<i64>,
    keys: Vec<SharedColumn>,
    values: Vec<SharedColumn>,
    next: SharedColumn,
    tails: Vec<i32>,
    num_records: i32,
}

impl GeneratedMap {
    pub fn new(descriptor: Arc<MapDescriptor>) -> Self {
        let keys = descriptor
            .key_types
            .iter()
            .map(|&ty| ColumnData::new(ty, 0).shared())
            .collect();
        let values = descriptor
            .value_types
            .iter()
            .map(|&ty| ColumnData::new(ty, 0).shared())
            .collect();
        Self {
            descriptor,
            slots: vec![EMPTY; INITIAL_SLOTS],
            hashes: Vec::new(),
            keys,
            values,
            next: ColumnData::Int(Vec::new()).shared(),
            tails: Vec::new(),
            num_records: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn num_records(&self) -> i32 {
        self.num_records
    }

    /// Backing array or record count by generated field name.
    pub fn field(&self, name: &str) -> DbxResult<Value> {
        if name == NUM_RECORDS_FIELD {
            return Ok(Value::Int(self.num_records));
        }
        if name == NEXT_FIELD && self.descriptor.kind == MapKind::JoinMultiRecord {
            return Ok(Value::Array(self.next.clone()));
        }
        let column = if let Some(i) = name.strip_prefix("keys_") {
            i.parse::<usize>().ok().and_then(|i| self.keys.get(i))
        } else if let Some(j) = name.strip_prefix("values_") {
            j.parse::<usize>().ok().and_then(|j| self.values.get(j))
        } else {
            None
        };
        column
            .map(|c| Value::Array(c.clone()))
            .ok_or_else(|| DbxError::execution(format!("no field '{name}'"), self.name().to_string()))
    }

    fn check_arity(&self, keys: &[Value], values: &[Value]) -> DbxResult<()> {
        if keys.len() != self.keys.len() || values.len() != self.values.len() {
            return Err(DbxError::execution(
                format!(
                    "expected {} keys and {} values, got {} and {}",
                    self.keys.len(),
                    self.values.len(),
                    keys.len(),
                    values.len()
                ),
                self.name().to_string(),
            ));
        }
        Ok(())
    }

    fn find_slot(&self, keys: &[Value], pre_hash: i64) -> DbxResult<usize> {
        let mask = self.slots.len() - 1;
        let mut slot = (pre_hash as u64 as usize) & mask;
        loop {
            let rec = self.slots[slot];
            if rec == EMPTY {
                return Ok(slot);
            }
            let rec = rec as usize;
            if self.hashes[rec] == pre_hash && self.keys_equal(rec, keys)? {
                return Ok(slot);
            }
            slot = (slot + 1) & mask;
        }
    }

    fn keys_equal(&self, rec: usize, keys: &[Value]) -> DbxResult<bool> {
        for (column, key) in self.keys.iter().zip(keys) {
            if column.borrow().get(rec)?.compare(key)? != std::cmp::Ordering::Equal {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn push_record(&mut self, keys: &[Value], pre_hash: i64, values: &[Value]) -> DbxResult<i32> {
        let rec = self.num_records;
        self.hashes.push(pre_hash);
        for (column, key) in self.keys.iter().zip(keys) {
            column.borrow_mut().push(key)?;
        }
        for (column, value) in self.values.iter().zip(values) {
            column.borrow_mut().push(value)?;
        }
        self.num_records += 1;
        Ok(rec)
    }

    /// Add `deltas` to the group of `keys`, inserting it on first sight.
    pub fn increment_for_key(&mut self, keys: &[Value], pre_hash: i64, deltas: &[Value]) -> DbxResult<()> {
        self.check_arity(keys, deltas)?;
        let slot = self.find_slot(keys, pre_hash)?;
        if self.slots[slot] == EMPTY {
            let rec = self.push_record(keys, pre_hash, deltas)?;
            self.slots[slot] = rec;
            self.grow();
            return Ok(());
        }
        let rec = self.slots[slot] as usize;
        for (column, delta) in self.values.iter().zip(deltas) {
            let mut column = column.borrow_mut();
            let sum = column.get(rec)?.binary(BinOp::Add, delta)?;
            column.set(rec, &sum)?;
        }
        Ok(())
    }

    /// Append a record, chaining it after the last record with equal key.
    pub fn associate(&mut self, keys: &[Value], pre_hash: i64, values: &[Value]) -> DbxResult<()> {
        self.check_arity(keys, values)?;
        let slot = self.find_slot(keys, pre_hash)?;
        let rec = self.push_record(keys, pre_hash, values)?;
        self.next.borrow_mut().push(&Value::Int(EMPTY))?;
        self.tails.push(rec);
        let head = self.slots[slot];
        if head == EMPTY {
            self.slots[slot] = rec;
        } else {
            let tail = self.tails[head as usize];
            self.next.borrow_mut().set(tail as usize, &Value::Int(rec))?;
            self.tails[head as usize] = rec;
        }
        self.grow();
        Ok(())
    }

    /// First record of the chain for `keys`, or -1.
    pub fn get_index(&self, keys: &[Value], pre_hash: i64) -> DbxResult<i32> {
        if keys.len() != self.keys.len() {
            return Err(DbxError::execution(
                format!("expected {} keys, got {}", self.keys.len(), keys.len()),
                self.name().to_string(),
            ));
        }
        Ok(self.slots[self.find_slot(keys, pre_hash)?])
    }

    fn grow(&mut self) {
        if (self.num_records as usize) * 2 <= self.slots.len() {
            return;
        }
        let mut slots = vec![EMPTY; self.slots.len() * 2];
        let mask = slots.len() - 1;
        for &head in self.slots.iter().filter(|&&r| r != EMPTY) {
            let mut slot = (self.hashes[head as usize] as u64 as usize) & mask;
            while slots[slot] != EMPTY {
                slot = (slot + 1) & mask;
            }
            slots[slot] = head;
        }
        self.slots = slots;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::types::LogicalType;
    use crate::runtime::hash::pre_hash;

    fn descriptor(desc: MapDescriptor) -> Arc<MapDescriptor> {
        Arc::new(desc)
    }

    #[test]
    fn test_increment_accumulates_per_group() {
        let mut map = GeneratedMap::new(descriptor(MapDescriptor::aggregation(
            vec![LogicalType::Int],
            vec![LogicalType::Long],
        )));
        for (k, v) in [(1, 10), (2, 20), (1, 5)] {
            let key = [Value::Int(k)];
            let h = pre_hash(&key[0]).unwrap();
            map.increment_for_key(&key, h, &[Value::Long(v)]).unwrap();
        }
        assert_eq!(map.num_records(), 2);
        let values = map.field("values_0").unwrap();
        assert_eq!(*values.as_array().unwrap().borrow(), ColumnData::Long(vec![15, 20]));
    }

    #[test]
    fn test_growth_keeps_every_group() {
        let mut map = GeneratedMap::new(descriptor(MapDescriptor::aggregation(
            vec![LogicalType::Long],
            vec![LogicalType::Int],
        )));
        for k in 0..100i64 {
            let key = [Value::Long(k % 40)];
            let h = pre_hash(&key[0]).unwrap();
            map.increment_for_key(&key, h, &[Value::Int(1)]).unwrap();
        }
        assert_eq!(map.num_records(), 40);
        let key = [Value::Long(7)];
        let slot = map.find_slot(&key, pre_hash(&key[0]).unwrap()).unwrap();
        assert_ne!(map.slots[slot], EMPTY);
    }

    #[test]
    fn test_join_chain_in_insertion_order() {
        let mut map = GeneratedMap::new(descriptor(MapDescriptor::join(
            LogicalType::Int,
            vec![LogicalType::Varchar],
        )));
        for (k, v) in [(1, "a"), (2, "b"), (1, "c")] {
            let key = [Value::Int(k)];
            let h = pre_hash(&key[0]).unwrap();
            map.associate(&key, h, &[Value::Bytes(v.as_bytes().to_vec())]).unwrap();
        }
        let key = [Value::Int(1)];
        let head = map.get_index(&key, pre_hash(&key[0]).unwrap()).unwrap();
        assert_eq!(head, 0);
        let next = map.field(NEXT_FIELD).unwrap();
        assert_eq!(*next.as_array().unwrap().borrow(), ColumnData::Int(vec![2, -1, -1]));

        let missing = [Value::Int(9)];
        assert_eq!(map.get_index(&missing, pre_hash(&missing[0]).unwrap()).unwrap(), EMPTY);
    }

    #[test]
    fn test_unknown_field() {
        let map = GeneratedMap::new(descriptor(MapDescriptor::aggregation(vec![LogicalType::Int], vec![])));
        assert!(map.field("values_0").is_err());
        assert!(map.field(NEXT_FIELD).is_err());
        assert!(matches!(map.field(NUM_RECORDS_FIELD).unwrap(), Value::Int(0)));
    }
}
