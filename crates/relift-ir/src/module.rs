//! The whole-program module.
//!
//! Arena storage with stable index handles: units and functions keep their
//! ids across removals, so passes can record edits as id lists and apply
//! them without rebuilding reference maps mid-pass.

use rustc_hash::FxHashMap;

use crate::function::Function;
use crate::regfile::RegisterFile;
use crate::unit::TranslationUnit;
use crate::{IrError, Result};

/// Handle to a standalone translation unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u32);

impl UnitId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a recovered function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl FuncId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a block within one function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Imported data object carried through for the downstream linker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataImport {
    pub addr: u64,
    pub size: u64,
    pub symbol: String,
}

/// One exclusively-owned in-memory program.
#[derive(Clone, Debug)]
pub struct Module {
    pub registers: RegisterFile,
    pub(crate) units: Vec<Option<TranslationUnit>>,
    pub(crate) functions: Vec<Option<Function>>,
    /// Cached start-address lookup for live units.
    pub(crate) unit_index: FxHashMap<u64, UnitId>,
    /// Pass-through metadata for the downstream linker.
    pub data_imports: Vec<DataImport>,
}

impl Module {
    pub fn new(registers: RegisterFile) -> Self {
        Self {
            registers,
            units: Vec::new(),
            functions: Vec::new(),
            unit_index: FxHashMap::default(),
            data_imports: Vec::new(),
        }
    }

    // ===== Units =====

    /// Add a translation unit. Its start address must be unique.
    pub fn add_unit(&mut self, unit: TranslationUnit) -> Result<UnitId> {
        if self.unit_index.contains_key(&unit.start) {
            return Err(IrError::DuplicateUnit { addr: unit.start });
        }
        let id = UnitId(self.units.len() as u32);
        self.unit_index.insert(unit.start, id);
        self.units.push(Some(unit));
        Ok(id)
    }

    pub fn unit(&self, id: UnitId) -> Option<&TranslationUnit> {
        self.units.get(id.index()).and_then(Option::as_ref)
    }

    pub fn unit_mut(&mut self, id: UnitId) -> Option<&mut TranslationUnit> {
        self.units.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Cached lookup of a live unit by start address.
    pub fn unit_by_addr(&self, addr: u64) -> Option<UnitId> {
        self.unit_index.get(&addr).copied()
    }

    /// Remove a unit, leaving a tombstone so other ids stay valid.
    pub fn remove_unit(&mut self, id: UnitId) -> Option<TranslationUnit> {
        let slot = self.units.get_mut(id.index())?;
        let unit = slot.take()?;
        self.unit_index.remove(&unit.start);
        Some(unit)
    }

    /// Live unit ids in arena order.
    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.is_some())
            .map(|(i, _)| UnitId(i as u32))
            .collect()
    }

    /// Number of live units.
    pub fn unit_count(&self) -> usize {
        self.units.iter().filter(|u| u.is_some()).count()
    }

    // ===== Functions =====

    pub fn add_function(&mut self, function: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(Some(function));
        id
    }

    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.index()).and_then(Option::as_ref)
    }

    pub fn function_mut(&mut self, id: FuncId) -> Option<&mut Function> {
        self.functions.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Find a function by entry address.
    pub fn function_by_entry(&self, entry: u64) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.as_ref().is_some_and(|f| f.entry == entry))
            .map(|i| FuncId(i as u32))
    }

    /// Live function ids in arena order.
    pub fn function_ids(&self) -> Vec<FuncId> {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_some())
            .map(|(i, _)| FuncId(i as u32))
            .collect()
    }

    /// Number of live functions.
    pub fn function_count(&self) -> usize {
        self.functions.iter().filter(|f| f.is_some()).count()
    }

    /// Two distinct mutable function borrows.
    ///
    /// Panics if the ids are equal or either is dead.
    pub fn functions_mut2(&mut self, a: FuncId, b: FuncId) -> (&mut Function, &mut Function) {
        assert_ne!(a, b);
        let (lo, hi, swap) = if a.index() < b.index() {
            (a.index(), b.index(), false)
        } else {
            (b.index(), a.index(), true)
        };
        let (left, right) = self.functions.split_at_mut(hi);
        let fa = left[lo].as_mut().expect("live function");
        let fb = right[0].as_mut().expect("live function");
        if swap { (fb, fa) } else { (fa, fb) }
    }
}
