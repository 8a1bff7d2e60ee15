//! Generated hash-map types
//!
//! Aggregation and join state lives in map types specialized per query: one
//! backing array per key/value column, an open-addressing slot table over the
//! pre-hash and, for join maps, a `next` record chain. [`MapDescriptor`]
//! describes such a type and renders its source; the reference executor
//! realizes the same layout in [`crate::runtime::map::GeneratedMap`].

use crate::codegen::types::LogicalType;
use std::fmt::Write;

/// Backing-array field holding the records' `i`-th key.
pub fn key_field(i: usize) -> String {
    format!("keys_{i}")
}

/// Backing-array field holding the records' `j`-th value.
pub fn value_field(j: usize) -> String {
    format!("values_{j}")
}

/// Record chain of a join map (`-1` terminates).
pub const NEXT_FIELD: &str = "next";

/// Number of groups/records inserted so far.
pub const NUM_RECORDS_FIELD: &str = "num_records";

/// Initial slot count of a generated map (power of two).
pub const INITIAL_SLOTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// One record per distinct key; values are accumulated in place
    Aggregation,
    /// Several records per key, chained in insertion order
    JoinMultiRecord,
}

/// 생성된 해시 맵 타입 기술자
#[derive(Debug, Clone, PartialEq)]
pub struct MapDescriptor {
    /// Assigned by [`GenerationContext::register_map_type`](crate::codegen::context::GenerationContext::register_map_type)
    pub name: String,
    pub kind: MapKind,
    pub key_types: Vec<LogicalType>,
    pub value_types: Vec<LogicalType>,
}

impl MapDescriptor {
    pub fn aggregation(key_types: Vec<LogicalType>, value_types: Vec<LogicalType>) -> Self {
        Self {
            name: String::new(),
            kind: MapKind::Aggregation,
            key_types,
            value_types,
        }
    }

    pub fn join(key_type: LogicalType, value_types: Vec<LogicalType>) -> Self {
        Self {
            name: String::new(),
            kind: MapKind::JoinMultiRecord,
            key_types: vec![key_type],
            value_types,
        }
    }

    /// Prefix of the type name the context assigns.
    pub fn type_prefix(&self) -> &'static str {
        match self.kind {
            MapKind::Aggregation => "AggMap",
            MapKind::JoinMultiRecord => "JoinMap",
        }
    }

    /// Render the specialized map type as source.
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) -> std::fmt::Result {
        let name = &self.name;
        writeln!(out, "struct {name} {{")?;
        writeln!(out, "    slots: Vec<i32>,")?;
        writeln!(out, "    hashes: Vec<i64>,")?;
        for (i, ty) in self.key_types.iter().enumerate() {
            writeln!(out, "    {}: {},", key_field(i), storage_type(ty))?;
        }
        for (j, ty) in self.value_types.iter().enumerate() {
            writeln!(out, "    {}: {},", value_field(j), storage_type(ty))?;
        }
        if self.kind == MapKind::JoinMultiRecord {
            writeln!(out, "    {NEXT_FIELD}: Vec<i32>,")?;
            writeln!(out, "    tails: Vec<i32>,")?;
        }
        writeln!(out, "    {NUM_RECORDS_FIELD}: i32,")?;
        writeln!(out, "}}")?;
        writeln!(out)?;
        writeln!(out, "impl {name} {{")?;
        writeln!(out, "    fn new() -> Self {{")?;
        writeln!(out, "        Self {{")?;
        writeln!(out, "            slots: vec![-1; {INITIAL_SLOTS}],")?;
        writeln!(out, "            hashes: Vec::new(),")?;
        for i in 0..self.key_types.len() {
            writeln!(out, "            {}: Vec::new(),", key_field(i))?;
        }
        for j in 0..self.value_types.len() {
            writeln!(out, "            {}: Vec::new(),", value_field(j))?;
        }
        if self.kind == MapKind::JoinMultiRecord {
            writeln!(out, "            {NEXT_FIELD}: Vec::new(),")?;
            writeln!(out, "            tails: Vec::new(),")?;
        }
        writeln!(out, "            {NUM_RECORDS_FIELD}: 0,")?;
        writeln!(out, "        }}")?;
        writeln!(out, "    }}")?;
        writeln!(out)?;
        self.render_find_slot(out)?;
        match self.kind {
            MapKind::Aggregation => self.render_increment(out)?,
            MapKind::JoinMultiRecord => {
                self.render_associate(out)?;
                self.render_get_index(out)?;
            }
        }
        self.render_grow(out)?;
        writeln!(out, "}}")
    }

    fn key_params(&self) -> String {
        self.key_types
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("key_{i}: {}", ty.rust_name()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn key_args(&self) -> String {
        (0..self.key_types.len())
            .map(|i| format!("key_{i}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn value_params(&self) -> String {
        self.value_types
            .iter()
            .enumerate()
            .map(|(j, ty)| format!(", value_{j}: {}", ty.rust_name()))
            .collect()
    }

    fn render_find_slot(&self, out: &mut String) -> std::fmt::Result {
        writeln!(
            out,
            "    fn find_slot(&self, {}, pre_hash: i64) -> usize {{",
            self.key_params()
        )?;
        writeln!(out, "        let mask = self.slots.len() - 1;")?;
        writeln!(out, "        let mut slot = (pre_hash as u64 as usize) & mask;")?;
        writeln!(out, "        loop {{")?;
        writeln!(out, "            let rec = self.slots[slot];")?;
        writeln!(out, "            if rec == -1 {{")?;
        writeln!(out, "                return slot;")?;
        writeln!(out, "            }}")?;
        let key_eq: String = (0..self.key_types.len())
            .map(|i| format!(" && self.{}[rec as usize] == key_{i}", key_field(i)))
            .collect();
        writeln!(
            out,
            "            if self.hashes[rec as usize] == pre_hash{key_eq} {{"
        )?;
        writeln!(out, "                return slot;")?;
        writeln!(out, "            }}")?;
        writeln!(out, "            slot = (slot + 1) & mask;")?;
        writeln!(out, "        }}")?;
        writeln!(out, "    }}")?;
        writeln!(out)
    }

    fn render_push_record(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "            let rec = self.{NUM_RECORDS_FIELD};")?;
        writeln!(out, "            self.hashes.push(pre_hash);")?;
        for i in 0..self.key_types.len() {
            writeln!(out, "            self.{}.push(key_{i});", key_field(i))?;
        }
        for j in 0..self.value_types.len() {
            writeln!(out, "            self.{}.push(value_{j});", value_field(j))?;
        }
        Ok(())
    }

    fn render_increment(&self, out: &mut String) -> std::fmt::Result {
        writeln!(
            out,
            "    fn increment_for_key(&mut self, {}, pre_hash: i64{}) {{",
            self.key_params(),
            self.value_params()
        )?;
        writeln!(
            out,
            "        let slot = self.find_slot({}, pre_hash);",
            self.key_args()
        )?;
        writeln!(out, "        if self.slots[slot] == -1 {{")?;
        self.render_push_record(out)?;
        writeln!(out, "            self.slots[slot] = rec;")?;
        writeln!(out, "            self.{NUM_RECORDS_FIELD} += 1;")?;
        writeln!(out, "            self.grow();")?;
        writeln!(out, "        }} else {{")?;
        writeln!(out, "            let rec = self.slots[slot] as usize;")?;
        for j in 0..self.value_types.len() {
            writeln!(out, "            self.{}[rec] += value_{j};", value_field(j))?;
        }
        writeln!(out, "        }}")?;
        writeln!(out, "    }}")?;
        writeln!(out)
    }

    fn render_associate(&self, out: &mut String) -> std::fmt::Result {
        writeln!(
            out,
            "    fn associate(&mut self, {}, pre_hash: i64{}) {{",
            self.key_params(),
            self.value_params()
        )?;
        writeln!(
            out,
            "        let slot = self.find_slot({}, pre_hash);",
            self.key_args()
        )?;
        writeln!(out, "        {{")?;
        self.render_push_record(out)?;
        writeln!(out, "            self.{NEXT_FIELD}.push(-1);")?;
        writeln!(out, "            self.tails.push(rec);")?;
        writeln!(out, "            let head = self.slots[slot];")?;
        writeln!(out, "            if head == -1 {{")?;
        writeln!(out, "                self.slots[slot] = rec;")?;
        writeln!(out, "            }} else {{")?;
        writeln!(out, "                let tail = self.tails[head as usize];")?;
        writeln!(out, "                self.{NEXT_FIELD}[tail as usize] = rec;")?;
        writeln!(out, "                self.tails[head as usize] = rec;")?;
        writeln!(out, "            }}")?;
        writeln!(out, "            self.{NUM_RECORDS_FIELD} += 1;")?;
        writeln!(out, "        }}")?;
        writeln!(out, "        self.grow();")?;
        writeln!(out, "    }}")?;
        writeln!(out)
    }

    fn render_get_index(&self, out: &mut String) -> std::fmt::Result {
        writeln!(
            out,
            "    fn get_index(&self, {}, pre_hash: i64) -> i32 {{",
            self.key_params()
        )?;
        writeln!(
            out,
            "        self.slots[self.find_slot({}, pre_hash)]",
            self.key_args()
        )?;
        writeln!(out, "    }}")?;
        writeln!(out)
    }

    fn render_grow(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "    fn grow(&mut self) {{")?;
        writeln!(
            out,
            "        if (self.{NUM_RECORDS_FIELD} as usize) * 2 <= self.slots.len() {{"
        )?;
        writeln!(out, "            return;")?;
        writeln!(out, "        }}")?;
        writeln!(out, "        let mut slots = vec![-1; self.slots.len() * 2];")?;
        writeln!(out, "        let mask = slots.len() - 1;")?;
        writeln!(out, "        for &head in self.slots.iter().filter(|&&r| r != -1) {{")?;
        writeln!(
            out,
            "            let mut slot = (self.hashes[head as usize] as u64 as usize) & mask;"
        )?;
        writeln!(out, "            while slots[slot] != -1 {{")?;
        writeln!(out, "                slot = (slot + 1) & mask;")?;
        writeln!(out, "            }}")?;
        writeln!(out, "            slots[slot] = head;")?;
        writeln!(out, "        }}")?;
        writeln!(out, "        self.slots = slots;")?;
        writeln!(out, "    }}")
    }
}

fn storage_type(ty: &LogicalType) -> String {
    match ty {
        LogicalType::FixedBinary(_) | LogicalType::Varchar => "Vec<Vec<u8>>".to_string(),
        other => format!("Vec<{}>", other.rust_name()),
    }
}
